//! Control API middleware. Request logging comes from `tracing_actix_web::TracingLogger`.

pub mod metrics;

pub use metrics::MetricsMiddleware;
