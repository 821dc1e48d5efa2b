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

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use fleetward_core::alloc::AllocError;
use fleetward_core::fleet::FleetError;
use fleetward_core::nat::NatError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Exhausted(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal server error")]
    Internal,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Exhausted(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::DeviceNotFound | FleetError::Alloc(AllocError::DeviceNotFound) => {
                Self::NotFound
            }
            FleetError::Unauthorized => Self::Unauthorized,
            FleetError::InvalidKey(e) => Self::Validation(e.to_string()),
            FleetError::AddressRejected(reason) => Self::Validation(reason),
            FleetError::Alloc(e @ AllocError::SubnetExhausted(_)) => Self::Exhausted(e.to_string()),
            FleetError::Nat(e @ (NatError::Exhausted { .. } | NatError::Conflict(_))) => {
                Self::Exhausted(e.to_string())
            }
            FleetError::Nat(NatError::NoTunnelAddress(_)) => {
                Self::Validation("device has no tunnel address".into())
            }
            FleetError::Alloc(AllocError::Store(_))
            | FleetError::Nat(_)
            | FleetError::Peer(_)
            | FleetError::Store(_) => {
                tracing::error!(error = %err, "fleet operation failed");
                Self::Internal
            }
        }
    }
}
