use kube::CustomResourceExt as _;
use mo_cluster::api::v1alpha1::{BucketClaim, CNClaim, CNPool, CNSet, LogSet};

fn main() {
    print!("{}", serde_yaml::to_string(&LogSet::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&BucketClaim::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&CNSet::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&CNPool::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&CNClaim::crd()).unwrap());
}
