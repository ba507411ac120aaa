//! Binding between a LogSet and the BucketClaim of its S3 path.

use std::collections::BTreeMap;

use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use kube::ResourceExt;
use tracing::*;

use crate::api::v1alpha1::{
    bucketclaim::BUCKET_PATH_HASH_LABEL, common::S3Provider, BucketBinding, BucketClaim, BucketClaimSpec,
    BucketClaimStatus, BucketState, LogSet,
};
use crate::reconciler::ReconcileContext;
use crate::util::{
    errors::{Error, Result},
    hash::path_hash,
};

#[derive(Debug, PartialEq)]
pub enum BucketCheck {
    /// The path is held by another LogSet
    Conflict(BucketBinding),
    /// Another LogSet bound the path concurrently through an older claim
    BackOff(BucketBinding),
    Missing,
    Unbound,
    Bound,
}

pub fn claim_name(s3: &S3Provider) -> String {
    format!("bucket-{}", path_hash(&s3.path))
}

pub fn binding(ls: &LogSet) -> Result<BucketBinding> {
    Ok(BucketBinding {
        namespace: ls.namespace().unwrap_or_default(),
        name: ls.name_any(),
        uid: ls.uid().ok_or_else(|| Error::metadata_missing("logset uid"))?,
    })
}

/// The claim of the path in the LogSet's namespace
pub fn own_claim<'a>(claims: &'a [BucketClaim], me: &BucketBinding, name: &str) -> Option<&'a BucketClaim> {
    claims
        .iter()
        .find(|c| c.namespace().as_deref() == Some(me.namespace.as_str()) && c.name_any() == name)
}

fn in_use(claim: &BucketClaim) -> bool {
    claim.status.as_ref().is_some_and(|s| s.state == BucketState::InUse)
}

/// Order in which concurrent bindings of one path are honoured: oldest claim first
fn seniority(claim: &BucketClaim) -> impl Ord {
    (claim.creation_timestamp(), claim.namespace(), claim.name_any())
}

/// Decides the binding step from every claim of the path across the cluster.
///
/// Claims live in the LogSet's namespace, so two LogSets of different
/// namespaces can both bind the path before either sees the other. When both
/// claims are in use, the LogSet of the newer claim backs off.
pub fn check(claims: &[BucketClaim], me: &BucketBinding, name: &str) -> BucketCheck {
    let mine = own_claim(claims, me, name);
    let held = mine.filter(|c| c.is_bound_to(me) && in_use(c));
    for claim in claims.iter().filter(|c| in_use(c)) {
        let Some(owner) = claim.binding().filter(|owner| *owner != me) else {
            continue;
        };
        match held {
            Some(m) if seniority(m) < seniority(claim) => {}
            Some(_) => return BucketCheck::BackOff(owner.clone()),
            None => return BucketCheck::Conflict(owner.clone()),
        }
    }
    match mine {
        None => BucketCheck::Missing,
        Some(c) if c.is_bound_to(me) => BucketCheck::Bound,
        Some(_) => BucketCheck::Unbound,
    }
}

pub fn desired_claim(ls: &LogSet, s3: &S3Provider) -> BucketClaim {
    BucketClaim {
        metadata: ObjectMeta {
            name: Some(claim_name(s3)),
            namespace: ls.namespace(),
            labels: Some(BTreeMap::from([(
                BUCKET_PATH_HASH_LABEL.to_string(),
                path_hash(&s3.path),
            )])),
            ..Default::default()
        },
        spec: BucketClaimSpec { s3: s3.clone() },
        status: None,
    }
}

pub fn bound_status(me: BucketBinding) -> BucketClaimStatus {
    BucketClaimStatus {
        bind_to: Some(me),
        state: BucketState::InUse,
        conditions: Vec::new(),
    }
}

/// Binds the claim as it was listed; a concurrent bind of the same claim fails with a conflict
pub fn bind_patch(claim: &BucketClaim, me: BucketBinding) -> serde_json::Value {
    let status = bound_status(me);
    serde_json::json!({
        "metadata": { "resourceVersion": claim.resource_version() },
        "status": {
            "bindTo": status.bind_to,
            "state": status.state,
        },
    })
}

fn released_status() -> serde_json::Value {
    serde_json::json!({
        "bindTo": null,
        "state": BucketState::Released,
    })
}

/// Binds the listed claim, then looks again for a LogSet that bound the path at
/// the same time and backs off if that one holds the older claim
pub async fn bind(rc: &ReconcileContext<LogSet>, claim: &BucketClaim, me: &BucketBinding) -> Result<()> {
    let name = claim.name_any();
    rc.api::<BucketClaim>()
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&bind_patch(claim, me.clone())))
        .await?;
    let claims = claims_of_path(rc, &claim.spec.s3).await?;
    if let BucketCheck::BackOff(owner) = check(&claims, me, &name) {
        info!("bucket path {} was bound concurrently by {owner}, backing off", claim.spec.s3.path);
        unbind(rc, &name).await?;
    }
    Ok(())
}

/// Drops this LogSet's binding, leaving the claim in place
pub async fn unbind(rc: &ReconcileContext<LogSet>, name: &str) -> Result<()> {
    rc.patch_status_of::<BucketClaim, _>(name, &released_status()).await
}

/// Claims of the same path in every namespace
pub async fn claims_of_path(rc: &ReconcileContext<LogSet>, s3: &S3Provider) -> Result<Vec<BucketClaim>> {
    let lp = ListParams::default().labels(&format!("{BUCKET_PATH_HASH_LABEL}={}", path_hash(&s3.path)));
    Ok(Api::<BucketClaim>::all(rc.client()).list(&lp).await?.items)
}

/// Unbinds the claim held by this LogSet; with the Delete policy the claim is deleted too
pub async fn release(rc: &ReconcileContext<LogSet>, s3: &S3Provider) -> Result<()> {
    let me = binding(rc.obj())?;
    let name = claim_name(s3);
    let Some(claim) = rc.get::<BucketClaim>(&name).await? else {
        return Ok(());
    };
    if claim.is_bound_to(&me) {
        unbind(rc, &name).await?;
    }
    if s3.retention_policy() == crate::api::v1alpha1::RetentionPolicy::Delete {
        rc.delete::<BucketClaim>(&name).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    fn me(uid: &str) -> BucketBinding {
        BucketBinding {
            namespace: "default".to_string(),
            name: "mo".to_string(),
            uid: uid.to_string(),
        }
    }

    fn claim(ns: &str, name: &str, status: Option<BucketClaimStatus>) -> BucketClaim {
        BucketClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: BucketClaimSpec::default(),
            status,
        }
    }

    #[test]
    fn missing_then_unbound_then_bound() {
        assert_eq!(check(&[], &me("u1"), "bucket-x"), BucketCheck::Missing);
        assert_eq!(check(&[claim("default", "bucket-x", None)], &me("u1"), "bucket-x"), BucketCheck::Unbound);
        assert_eq!(
            check(&[claim("default", "bucket-x", Some(bound_status(me("u1"))))], &me("u1"), "bucket-x"),
            BucketCheck::Bound
        );
    }

    #[test]
    fn path_held_elsewhere_conflicts() {
        let other = BucketBinding {
            namespace: "team-b".to_string(),
            name: "mo".to_string(),
            uid: "u2".to_string(),
        };
        let claims = [claim("team-b", "bucket-x", Some(bound_status(other.clone())))];
        assert_eq!(check(&claims, &me("u1"), "bucket-x"), BucketCheck::Conflict(other));
    }

    #[test]
    fn concurrent_bind_keeps_the_older_claim() {
        let other = BucketBinding {
            namespace: "team-b".to_string(),
            name: "mo".to_string(),
            uid: "u2".to_string(),
        };
        let created = |c: &mut BucketClaim, secs: i64| {
            c.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(secs, 0).unwrap()));
        };
        let mut mine = claim("default", "bucket-x", Some(bound_status(me("u1"))));
        let mut theirs = claim("team-b", "bucket-x", Some(bound_status(other.clone())));

        created(&mut mine, 100);
        created(&mut theirs, 200);
        let claims = [mine.clone(), theirs.clone()];
        assert_eq!(check(&claims, &me("u1"), "bucket-x"), BucketCheck::Bound);
        assert_eq!(check(&claims, &other, "bucket-x"), BucketCheck::BackOff(me("u1")));

        created(&mut mine, 300);
        let claims = [mine, theirs];
        assert_eq!(check(&claims, &me("u1"), "bucket-x"), BucketCheck::BackOff(other.clone()));
        assert_eq!(check(&claims, &other, "bucket-x"), BucketCheck::Bound);
    }

    #[test]
    fn bind_is_conditional_on_listed_version() {
        let listed = claim("default", "bucket-x", None);
        let patch = bind_patch(&listed, me("u1"));
        assert_eq!(patch["metadata"]["resourceVersion"], "7");
        assert_eq!(patch["status"]["bindTo"]["uid"], "u1");
        assert_eq!(patch["status"]["state"], "InUse");
        assert!(patch["status"].get("conditions").is_none());
    }

    #[test]
    fn recreated_logset_rebinds_released_claim() {
        let released = BucketClaimStatus {
            bind_to: None,
            state: BucketState::Released,
            conditions: Vec::new(),
        };
        assert_eq!(
            check(&[claim("default", "bucket-x", Some(released))], &me("u3"), "bucket-x"),
            BucketCheck::Unbound
        );
    }

    #[test]
    fn claim_is_named_after_path() {
        let s3 = S3Provider {
            path: "test/bucket".to_string(),
            ..Default::default()
        };
        assert_eq!(claim_name(&s3), "bucket-7834c0913fbe7612");
    }
}
