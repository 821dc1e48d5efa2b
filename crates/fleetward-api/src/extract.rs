// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::future::{Ready, ready};

use actix_web::dev::Payload;
use actix_web::web::Data;
use actix_web::{FromRequest, HttpRequest};
use uuid::Uuid;

use crate::auth::validate_token;
use crate::config::Config;
use crate::error::ApiError;

fn bearer(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// An operator authenticated with an admin JWT, from the `token` cookie or
/// a bearer header.
pub struct AdminUser {
    pub user_id: Uuid,
}

impl FromRequest for AdminUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract_admin(req))
    }
}

fn extract_admin(req: &HttpRequest) -> Result<AdminUser, ApiError> {
    let config = req
        .app_data::<Data<Config>>()
        .ok_or(ApiError::Internal)?;

    let cookie = req.cookie("token");
    let token = match &cookie {
        Some(cookie) => cookie.value(),
        None => bearer(req).ok_or(ApiError::Unauthorized)?,
    };
    let claims = validate_token(token, &config.jwt_secret)?;

    Ok(AdminUser {
        user_id: claims.sub,
    })
}

/// Per-device callback token from the bearer header. Resolved to a device
/// by the fleet operation that consumes it.
#[derive(Debug)]
pub struct DeviceToken(pub String);

impl FromRequest for DeviceToken {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(
            bearer(req)
                .map(|t| DeviceToken(t.to_string()))
                .ok_or(ApiError::Unauthorized),
        )
    }
}
