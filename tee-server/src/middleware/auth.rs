//! Bearer token authentication
//!
//! All endpoints except `/health` require `Authorization: Bearer <token>`,
//! compared in constant time. Authentication can only be switched off with
//! an explicit configuration flag.

use super::logging::RequestId;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, HttpMessage, HttpResponse};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;

pub struct BearerAuth {
    token: Option<Rc<str>>,
    disabled: bool,
}

impl BearerAuth {
    pub fn new(token: Option<String>, disabled: bool) -> Self {
        Self {
            token: token.map(Rc::from),
            disabled,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for BearerAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = BearerAuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(BearerAuthMiddleware {
            service,
            token: self.token.clone(),
            disabled: self.disabled,
        }))
    }
}

pub struct BearerAuthMiddleware<S> {
    service: S,
    token: Option<Rc<str>>,
    disabled: bool,
}

impl<S, B> Service<ServiceRequest> for BearerAuthMiddleware<S>
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
        // Health checks stay reachable for load balancers and probes.
        if self.disabled || req.path() == "/health" {
            let fut = self.service.call(req);
            return Box::pin(async move { Ok(fut.await?.map_into_left_body()) });
        }

        let rejection = match authorization_token(&req) {
            None => Some("missing or malformed authorization header"),
            Some(supplied) => match &self.token {
                Some(expected) if constant_time_eq(supplied.as_bytes(), expected.as_bytes()) => {
                    None
                }
                _ => Some("invalid bearer token"),
            },
        };

        match rejection {
            None => {
                let fut = self.service.call(req);
                Box::pin(async move { Ok(fut.await?.map_into_left_body()) })
            }
            Some(reason) => {
                let request_id = req
                    .extensions()
                    .get::<RequestId>()
                    .map(|id| id.0.clone())
                    .unwrap_or_default();
                tracing::warn!(
                    request_id = %request_id,
                    path = %req.path(),
                    reason,
                    "unauthorized request"
                );
                Box::pin(async move {
                    let (req, _) = req.into_parts();
                    let response = HttpResponse::Unauthorized()
                        .body("Unauthorized")
                        .map_into_right_body();
                    Ok(ServiceResponse::new(req, response))
                })
            }
        }
    }
}

fn authorization_token(req: &ServiceRequest) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Byte-wise comparison that does not short-circuit on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
