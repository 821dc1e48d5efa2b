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

//! Endpoints called by the routers themselves, authenticated with their
//! per-device callback token.

use actix_web::{web, HttpResponse};
use fleetward_types::callback::{HeartbeatRequest, PhoneHomeRequest};

use crate::AppFleet;
use crate::error::ApiError;
use crate::extract::DeviceToken;

async fn phone_home(
    DeviceToken(token): DeviceToken,
    fleet: web::Data<AppFleet>,
    body: web::Json<PhoneHomeRequest>,
) -> Result<HttpResponse, ApiError> {
    let response = fleet.phone_home(&token, &body).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn heartbeat(
    DeviceToken(token): DeviceToken,
    fleet: web::Data<AppFleet>,
    body: web::Json<HeartbeatRequest>,
) -> Result<HttpResponse, ApiError> {
    fleet.heartbeat(&token, &body).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/callback/phone-home").route(web::post().to(phone_home)))
        .service(web::resource("/api/callback/heartbeat").route(web::post().to(heartbeat)));
}
