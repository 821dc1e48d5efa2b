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

use actix_web::{web, HttpResponse};
use tracing::info;
use uuid::Uuid;

use crate::AppFleet;
use crate::error::ApiError;
use crate::extract::AdminUser;

async fn list_devices(
    _admin: AdminUser,
    fleet: web::Data<AppFleet>,
) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(fleet.device_views().await?))
}

async fn get_device(
    _admin: AdminUser,
    fleet: web::Data<AppFleet>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let view = fleet.device_view(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(view))
}

async fn onboard_device(
    admin: AdminUser,
    fleet: web::Data<AppFleet>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let device_id = path.into_inner();
    info!(admin = %admin.user_id, %device_id, "onboarding requested");
    let onboarding = fleet.onboard(device_id).await?;
    Ok(HttpResponse::Ok().json(onboarding))
}

async fn decommission_device(
    admin: AdminUser,
    fleet: web::Data<AppFleet>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let device_id = path.into_inner();
    info!(admin = %admin.user_id, %device_id, "decommission requested");
    fleet.decommission(device_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/devices").route(web::get().to(list_devices)))
        .service(
            web::resource("/api/devices/{id}")
                .route(web::get().to(get_device))
                .route(web::delete().to(decommission_device)),
        )
        .service(
            web::resource("/api/devices/{id}/onboard").route(web::post().to(onboard_device)),
        );
}
