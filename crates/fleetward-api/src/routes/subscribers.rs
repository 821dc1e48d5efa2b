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

use crate::AppFleet;
use crate::error::ApiError;
use crate::extract::AdminUser;

async fn get_subscriber(
    _admin: AdminUser,
    fleet: web::Data<AppFleet>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let subscriber = fleet
        .subscriber(&path.into_inner())
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(subscriber))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/subscribers/{identity}").route(web::get().to(get_subscriber)),
    );
}
