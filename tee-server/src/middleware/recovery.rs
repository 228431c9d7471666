//! Panic recovery
//!
//! A panicking handler becomes a 500 with the request id in the log instead
//! of a dropped connection.

use super::logging::RequestId;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, HttpMessage, HttpResponse};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;

pub struct Recovery;

impl<S, B> Transform<S, ServiceRequest> for Recovery
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RecoveryMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RecoveryMiddleware { service }))
    }
}

pub struct RecoveryMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RecoveryMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let (http_req, payload) = req.into_parts();
        let recovered = http_req.clone();
        let fut = self
            .service
            .call(ServiceRequest::from_parts(http_req, payload));

        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result.map(|res| res.map_into_left_body()),
                Err(panic) => {
                    let request_id = recovered
                        .extensions()
                        .get::<RequestId>()
                        .map(|id| id.0.clone())
                        .unwrap_or_default();
                    tracing::error!(
                        request_id = %request_id,
                        method = %recovered.method(),
                        path = %recovered.path(),
                        panic = %panic_message(panic.as_ref()),
                        "panic recovered"
                    );
                    let response = HttpResponse::InternalServerError()
                        .body("Internal Server Error")
                        .map_into_right_body();
                    Ok(ServiceResponse::new(recovered, response))
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};

    #[actix_web::test]
    async fn panicking_handler_becomes_500() {
        let app = test::init_service(App::new().wrap(Recovery).route(
            "/boom",
            web::get().to(|| async {
                panic!("handler exploded");
                #[allow(unreachable_code)]
                HttpResponse::Ok()
            }),
        ))
        .await;

        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/boom").to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[actix_web::test]
    async fn healthy_handlers_pass_through() {
        let app = test::init_service(
            App::new()
                .wrap(Recovery)
                .route("/ok", web::get().to(HttpResponse::Ok)),
        )
        .await;
        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/ok").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
