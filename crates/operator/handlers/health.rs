use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actix_web::{get, web::Data, HttpRequest, HttpResponse, Responder};
use mo_cluster::reconciler::State;

/// Flipped once every enabled controller has been started
#[derive(Clone, Default)]
pub struct Readiness(pub Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[get("/healthz")]
pub async fn healthz(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
pub async fn readyz(ready: Data<Readiness>, _req: HttpRequest) -> impl Responder {
    if ready.0.load(Ordering::Relaxed) {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json("starting")
    }
}

#[get("/")]
pub async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}
