//! Extractors whose rejections come back in the response envelope.

use axum::extract::{FromRequest, FromRequestParts};

use crate::core::error::FleetError;

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(FleetError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(FleetError))]
pub struct ApiPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(FleetError))]
pub struct ApiQuery<T>(pub T);
