use actix_web::{dev::Server, middleware, web::Data, App, HttpServer};
use anyhow::Result;
use mo_cluster::reconciler::State;

use crate::handlers::{
    health::{self, Readiness},
    metrics,
};

/// Serves `/metrics` and the reconciler diagnostics
pub fn metrics_server(state: State, bind: &str) -> Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/metrics"))
            .service(health::index)
            .service(metrics::metrics)
    })
    .bind(bind)?
    .shutdown_timeout(5);
    Ok(server.run())
}

/// Serves the liveness and readiness probes
pub fn probe_server(ready: Readiness, bind: &str) -> Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(ready.clone()))
            .service(health::healthz)
            .service(health::readyz)
    })
    .bind(bind)?
    .shutdown_timeout(5);
    Ok(server.run())
}
