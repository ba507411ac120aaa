//! BucketClaim controller: guards deletion of a claimed S3 path and reclaims it
//! with a cleanup job under the Delete policy.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use kube::{
    api::Api,
    runtime::{watcher, Controller},
    ResourceExt,
};
use serde_json::json;
use tracing::*;

use crate::api::v1alpha1::{
    bucketclaim::RECYCLABLE_CONDITION, common::SharedStorageProvider, BucketClaim, RetentionPolicy,
};
use crate::controllers::common::process_env;
use crate::reconciler::{run_controller, watch_all, Actor, Context, ReconcileContext, Reconciler};
use crate::util::{
    config::BucketCleanJob,
    errors::Result,
    status::{condition, set_status_condition},
};

pub const CONTROLLER_NAME: &str = "bucketclaim";

pub const REASON_IN_USE: &str = "InUse";
pub const REASON_RETAINED: &str = "Retained";
pub const REASON_RELEASED: &str = "Released";

/// Removes every object under the path; a missing bucket or key counts as done
const CLEAN_SCRIPT: &str = r#"set -u
out=$(aws s3 rm --recursive "s3://${BUCKET}/${PREFIX}" ${ENDPOINT_ARGS} 2>&1) && { echo "$out"; exit 0; }
echo "$out"
case "$out" in
  *NoSuchBucket*|*NoSuchKey*) echo "nothing to clean"; exit 0 ;;
esac
exit 1
"#;

pub enum BucketClaimAction {
    SetRecyclable(Condition),
}

impl fmt::Display for BucketClaimAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BucketClaimAction::SetRecyclable(c) => write!(f, "set {} to {} ({})", c.type_, c.status, c.reason),
        }
    }
}

/// Whether the path may be reclaimed, and why
pub fn recyclable(claim: &BucketClaim) -> (bool, &'static str) {
    if claim.binding().is_some() {
        return (false, REASON_IN_USE);
    }
    match claim.spec.s3.retention_policy() {
        RetentionPolicy::Delete => (true, REASON_RELEASED),
        RetentionPolicy::Retain => (false, REASON_RETAINED),
    }
}

pub fn clean_job_name(claim: &BucketClaim) -> String {
    format!("{}-clean", claim.name_any())
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn clean_job(claim: &BucketClaim, cfg: &BucketCleanJob) -> Job {
    let s3 = &claim.spec.s3;
    let mut envs = process_env(&SharedStorageProvider {
        file_system: None,
        s3: Some(s3.clone()),
    });
    envs.push(env("BUCKET", s3.bucket()));
    envs.push(env("PREFIX", s3.prefix()));
    envs.push(env(
        "ENDPOINT_ARGS",
        s3.endpoint
            .as_ref()
            .map(|e| format!("--endpoint-url {e}"))
            .unwrap_or_default(),
    ));
    if let Some(region) = &s3.region {
        envs.push(env("AWS_REGION", region.as_str()));
    }

    let pull_secrets: Vec<LocalObjectReference> = cfg
        .pull_secrets
        .iter()
        .map(|name| LocalObjectReference { name: name.clone() })
        .collect();

    Job {
        metadata: ObjectMeta {
            name: Some(clean_job_name(claim)),
            namespace: claim.namespace(),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    image_pull_secrets: Some(pull_secrets).filter(|s| !s.is_empty()),
                    containers: vec![Container {
                        name: "clean".to_string(),
                        image: Some(cfg.image.clone()),
                        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), CLEAN_SCRIPT.to_string()]),
                        env: Some(envs),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn job_succeeded(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) > 0
}

fn job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Failed" && c.status == "True"))
}

/// Status patch touching only the conditions; `bindTo` and `state` belong to the LogSet
pub fn conditions_patch(claim: &BucketClaim, c: Condition) -> serde_json::Value {
    let current = claim.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default();
    json!({ "conditions": set_status_condition(current, c).0 })
}

pub struct BucketClaimActor;

impl BucketClaimActor {
    fn recyclable_condition(claim: &BucketClaim) -> Option<Condition> {
        let (ok, reason) = recyclable(claim);
        let message = match reason {
            REASON_IN_USE => format!(
                "bucket is bound to {}",
                claim.binding().map(ToString::to_string).unwrap_or_default()
            ),
            REASON_RETAINED => "retention policy is Retain, remove the finalizer to delete".to_string(),
            _ => "bucket is released and will be cleaned on deletion".to_string(),
        };
        let status = claim.status.clone().unwrap_or_default();
        let (_, changed) = set_status_condition(
            &status.conditions,
            condition(RECYCLABLE_CONDITION, ok, reason, message.clone(), claim.metadata.generation),
        );
        changed.then(|| condition(RECYCLABLE_CONDITION, ok, reason, message, claim.metadata.generation))
    }
}

#[async_trait]
impl Actor<BucketClaim> for BucketClaimActor {
    type Action = BucketClaimAction;

    async fn observe(&self, rc: &ReconcileContext<BucketClaim>) -> Result<Option<BucketClaimAction>> {
        Ok(Self::recyclable_condition(rc.obj()).map(BucketClaimAction::SetRecyclable))
    }

    async fn act(&self, rc: &ReconcileContext<BucketClaim>, action: BucketClaimAction) -> Result<()> {
        match action {
            BucketClaimAction::SetRecyclable(c) => rc.patch_status(&conditions_patch(rc.obj(), c)).await,
        }
    }

    async fn finalize(&self, rc: &ReconcileContext<BucketClaim>) -> Result<bool> {
        let claim = rc.obj();
        if let Some(c) = Self::recyclable_condition(claim) {
            if c.reason == REASON_IN_USE {
                rc.warn(REASON_IN_USE, c.message.clone()).await;
            }
            self.act(rc, BucketClaimAction::SetRecyclable(c)).await?;
        }
        match recyclable(claim) {
            (false, reason) => {
                debug!("bucket claim {} is not recyclable: {reason}", claim.name_any());
                Ok(false)
            }
            (true, _) => {
                let name = clean_job_name(claim);
                match rc.get::<Job>(&name).await? {
                    None => {
                        info!("reclaiming s3 path {}", claim.spec.s3.path);
                        rc.create_owned(clean_job(claim, &rc.config().bucket_clean_job)).await?;
                        Ok(false)
                    }
                    Some(job) if job_succeeded(&job) => Ok(true),
                    Some(job) => {
                        if job_failed(&job) {
                            rc.warn(
                                "BucketCleanFailed",
                                format!("job {name} failed, delete it to retry"),
                            )
                            .await;
                        }
                        Ok(false)
                    }
                }
            }
        }
    }
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let controller = Controller::new(Api::<BucketClaim>::all(client.clone()), watch_all())
        .owns(Api::<Job>::all(client), watcher::Config::default());
    run_controller(controller, Reconciler::new(CONTROLLER_NAME, ctx, BucketClaimActor)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::{common::S3Provider, BucketBinding, BucketClaimSpec, BucketClaimStatus, BucketState};

    fn claim(policy: RetentionPolicy, bound: bool) -> BucketClaim {
        BucketClaim {
            metadata: ObjectMeta {
                name: Some("bucket-7834c0913fbe7612".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: BucketClaimSpec {
                s3: S3Provider {
                    path: "test/bucket".to_string(),
                    endpoint: Some("http://minio:9000".to_string()),
                    secret_ref: Some("aws".to_string()),
                    s3_retention_policy: Some(policy),
                    ..Default::default()
                },
            },
            status: Some(BucketClaimStatus {
                bind_to: bound.then(|| BucketBinding {
                    namespace: "default".to_string(),
                    name: "mo".to_string(),
                    uid: "u1".to_string(),
                }),
                state: if bound { BucketState::InUse } else { BucketState::Released },
                conditions: Vec::new(),
            }),
        }
    }

    #[test]
    fn bound_claim_refuses_deletion() {
        assert_eq!(recyclable(&claim(RetentionPolicy::Delete, true)), (false, REASON_IN_USE));
        assert_eq!(recyclable(&claim(RetentionPolicy::Retain, false)), (false, REASON_RETAINED));
        assert_eq!(recyclable(&claim(RetentionPolicy::Delete, false)), (true, REASON_RELEASED));
    }

    #[test]
    fn condition_is_written_once() {
        let mut c = claim(RetentionPolicy::Delete, true);
        let cond = BucketClaimActor::recyclable_condition(&c).unwrap();
        assert_eq!(cond.status, "False");
        c.status.as_mut().unwrap().conditions = vec![cond];
        assert!(BucketClaimActor::recyclable_condition(&c).is_none());
    }

    #[test]
    fn recyclable_patch_leaves_binding_alone() {
        let c = claim(RetentionPolicy::Delete, true);
        let cond = BucketClaimActor::recyclable_condition(&c).unwrap();
        let patch = conditions_patch(&c, cond);
        let fields: Vec<&String> = patch.as_object().unwrap().keys().collect();
        assert_eq!(fields, vec!["conditions"]);
        assert_eq!(patch["conditions"][0]["type"], RECYCLABLE_CONDITION);
        assert_eq!(patch["conditions"][0]["reason"], REASON_IN_USE);
    }

    #[test]
    fn clean_job_targets_path() {
        let cfg = BucketCleanJob {
            image: "aws-cli:custom".to_string(),
            pull_secrets: vec!["regcred".to_string()],
        };
        let job = clean_job(&claim(RetentionPolicy::Delete, false), &cfg);
        assert_eq!(job.name_any(), "bucket-7834c0913fbe7612-clean");
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "regcred");
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("aws-cli:custom"));
        let env = container.env.as_ref().unwrap();
        let value = |k: &str| env.iter().find(|e| e.name == k).and_then(|e| e.value.clone());
        assert_eq!(value("BUCKET").as_deref(), Some("test"));
        assert_eq!(value("PREFIX").as_deref(), Some("bucket"));
        assert_eq!(value("ENDPOINT_ARGS").as_deref(), Some("--endpoint-url http://minio:9000"));
        assert!(env.iter().any(|e| e.name == "AWS_SECRET_ACCESS_KEY"));
        assert!(container.command.as_ref().unwrap()[2].contains("NoSuchBucket"));
    }
}
