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

mod auth;
mod config;
mod error;
mod extract;
mod middleware;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer};
use clap::Parser;
use fleetward_core::credentials::CredentialCipher;
use fleetward_core::db::pg::{self, PgStore};
use fleetward_core::fleet::Fleet;
use fleetward_core::nat::PortAllocator;
use fleetward_core::peers::PeerStore;
use fleetward_core::platform::{CurrentPlatform, Platform};
use fleetward_core::probe::RouterOsClient;
use fleetward_core::scheduler::FleetScheduler;
use fleetward_core::sessions::{ReconcileSettings, SessionReconciler};
use tracing::{info, warn};

use crate::config::Config;
use crate::middleware::RequestLogger;

pub(crate) type AppFleet = Fleet<PgStore, CurrentPlatform>;
pub(crate) type AppScheduler = FleetScheduler<PgStore, RouterOsClient, CurrentPlatform>;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = "fleetward")]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Tunnel, console and session engine for a fleet of remote routers")]
struct Args {
    /// Path to the fleet configuration file (overrides FLEET_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sweep interval in seconds (overrides the config file)
    #[arg(short, long)]
    interval: Option<u64>,

    /// Run a single fleet cycle, print its summary and exit
    #[arg(long)]
    once: bool,
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let config = Config::from_env()?;
    let fleet_path = args.config.clone().unwrap_or_else(|| config.fleet_config.clone());
    let mut fleet_toml = fleetward_core::config::load(&fleet_path).await?;
    if let Some(secs) = args.interval {
        fleet_toml.schedule.interval_secs = secs;
    }
    let settings = fleet_toml.validate()?;
    info!(
        version = env!("GIT_VERSION"),
        config = %fleet_path.display(),
        subnet = %settings.tunnel.subnet,
        "starting fleetward"
    );

    let pool = pg::create_pool(&config.database_url).await?;
    pg::migrate(&pool).await?;
    info!("database migrations applied");
    let store = Arc::new(PgStore::new(pool));
    let cipher = CredentialCipher::new(config.credential_key);

    let interface = settings.tunnel.interface.as_str();
    match CurrentPlatform::interface_exists(interface).await {
        Ok(true) => {}
        Ok(false) => info!(interface, "hub interface missing, created on first apply"),
        Err(e) => warn!(interface, error = %e, "could not inspect hub interface"),
    }
    let peers = Arc::new(PeerStore::<CurrentPlatform>::open(settings.tunnel.clone()).await?);
    let report = peers.reconcile_all(store.as_ref()).await?;
    if report.failed > 0 {
        warn!(failed = report.failed, errors = ?report.errors, "startup peer sync incomplete");
    }

    let management = Arc::new(RouterOsClient::new(settings.schedule.probe_timeout)?);
    let reconciler = SessionReconciler::new(
        Arc::clone(&store),
        Arc::clone(&management),
        cipher.clone(),
        ReconcileSettings {
            accounting_window: settings.sessions.accounting_window,
            idle_timeout: settings.sessions.idle_timeout,
            enumerate_timeout: settings.schedule.probe_timeout,
            max_workers: settings.schedule.max_workers,
        },
    );
    let scheduler: Arc<AppScheduler> = Arc::new(FleetScheduler::new(
        Arc::clone(&store),
        management,
        Arc::clone(&peers),
        reconciler,
        cipher,
        settings.schedule.clone(),
    ));

    if args.once {
        let summary = scheduler.run_cycle().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let ports = Arc::new(PortAllocator::new(
        settings.console.public_address,
        settings.tunnel.hub_address(),
        settings.console.ports.clone(),
    ));
    let fleet: AppFleet = Fleet::new(store, peers, ports, settings)?;

    let bind = config.bind_addr.clone();
    info!(addr = %bind, "starting http server");

    let config_data = web::Data::new(config);
    let fleet_data = web::Data::new(fleet);
    let scheduler_data = web::Data::from(Arc::clone(&scheduler));

    actix_web::rt::spawn(async move { scheduler.run().await });

    HttpServer::new(move || {
        App::new()
            .app_data(config_data.clone())
            .app_data(fleet_data.clone())
            .app_data(scheduler_data.clone())
            .wrap(RequestLogger)
            .route("/health", web::get().to(health))
            .configure(routes::devices::configure)
            .configure(routes::subscribers::configure)
            .configure(routes::fleet::configure)
            .configure(routes::callback::configure)
    })
    .bind(&bind)?
    .run()
    .await?;

    Ok(())
}
