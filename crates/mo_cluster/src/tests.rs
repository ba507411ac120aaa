#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::{Api, ObjectMeta, Patch, PatchParams};
    use kube::Client;

    use crate::api::v1alpha1::{
        common::{FileSystemProvider, ObjectRef, PodSet, SharedStorageProvider, Volume},
        CNPool, CNPoolSpec, CNSet, CNSetSpec, LogSet, LogSetSpec,
    };
    use crate::controllers::{cnpool::CNPoolActor, logset::LogSetActor};
    use crate::hakeeper::fake::FakeFactory;
    use crate::reconciler::{reconcile, Context, Reconciler, State};
    use crate::util::config::OperatorConfig;

    const IMAGE: &str = "matrixorigin/matrixone:1.2.0";

    fn context(client: Client) -> Arc<Context> {
        State::default()
            .to_context(client, OperatorConfig::default(), Arc::new(FakeFactory::default()))
            .unwrap()
    }

    fn logset() -> LogSet {
        LogSet {
            metadata: ObjectMeta {
                name: Some("it-mo".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: LogSetSpec {
                pod_set: PodSet {
                    replicas: 3,
                    image: IMAGE.to_string(),
                    ..Default::default()
                },
                volume: Volume {
                    size: Quantity("1Gi".to_string()),
                    storage_class_name: None,
                },
                shared_storage: SharedStorageProvider {
                    file_system: Some(FileSystemProvider {
                        path: "/data/shared".to_string(),
                    }),
                    s3: None,
                },
                ..Default::default()
            },
            status: None,
        }
    }

    #[tokio::test]
    #[ignore = "uses k8s current-context"]
    async fn integration_logset_renders_statefulset() {
        let client = Client::try_default().await.unwrap();
        let ctx = context(client.clone());
        let logsets: Api<LogSet> = Api::namespaced(client.clone(), "default");
        let ls = logset();
        logsets
            .patch("it-mo", &PatchParams::apply("ctrltest").force(), &Patch::Apply(&ls))
            .await
            .unwrap();

        let reconciler = Arc::new(Reconciler::new("logset", ctx, LogSetActor));
        for _ in 0..5 {
            let latest = logsets.get("it-mo").await.unwrap();
            reconcile(Arc::new(latest), reconciler.clone()).await.unwrap();
        }

        let sts: Api<StatefulSet> = Api::namespaced(client.clone(), "default");
        let rendered = sts.get("it-mo-log").await.unwrap();
        assert_eq!(rendered.spec.unwrap().replicas, Some(3));
        let output = logsets.get("it-mo").await.unwrap();
        assert!(output.status.is_some());
    }

    #[tokio::test]
    #[ignore = "uses k8s current-context"]
    async fn integration_pool_owns_cnset() {
        let client = Client::try_default().await.unwrap();
        let ctx = context(client.clone());
        let pool = CNPool {
            metadata: ObjectMeta {
                name: Some("it-pool".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: CNPoolSpec {
                template: CNSetSpec {
                    pod_set: PodSet {
                        image: IMAGE.to_string(),
                        ..Default::default()
                    },
                    logset_ref: ObjectRef {
                        name: "it-mo".to_string(),
                        namespace: None,
                    },
                    ..Default::default()
                },
                pod_labels: BTreeMap::from([("tier".to_string(), "serverless".to_string())]),
                ..Default::default()
            },
            status: None,
        };
        let pools: Api<CNPool> = Api::namespaced(client.clone(), "default");
        pools
            .patch("it-pool", &PatchParams::apply("ctrltest").force(), &Patch::Apply(&pool))
            .await
            .unwrap();

        let reconciler = Arc::new(Reconciler::new("cnpool", ctx, CNPoolActor));
        for _ in 0..3 {
            let latest = pools.get("it-pool").await.unwrap();
            reconcile(Arc::new(latest), reconciler.clone()).await.unwrap();
        }

        let cnsets: Api<CNSet> = Api::namespaced(client, "default");
        let cn = cnsets.get("it-pool").await.unwrap();
        assert!(cn.spec.scaling_config.drain_enabled());
        assert_eq!(cn.spec.pod_labels.get("tier").map(String::as_str), Some("serverless"));
    }
}
