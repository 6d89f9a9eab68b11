use std::net::SocketAddr;

use clap::Parser;
use reelgate::cli::{
    ACCESS_SECRET_ENV, Args, REFRESH_SECRET_ENV, build_config, init_logging, load_secret,
    open_database, validate_public_origin,
};
use reelgate::create_app;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args.log_format);

    let Some(access_secret) = load_secret(ACCESS_SECRET_ENV, args.access_secret_file.as_deref())
    else {
        std::process::exit(1);
    };

    let Some(refresh_secret) = load_secret(REFRESH_SECRET_ENV, args.refresh_secret_file.as_deref())
    else {
        std::process::exit(1);
    };

    if access_secret == refresh_secret {
        error!("Access and refresh token secrets must differ");
        std::process::exit(1);
    }

    let Some(public_origin) = validate_public_origin(&args.public_origin) else {
        std::process::exit(1);
    };

    let Some(db) = open_database(&args.database).await else {
        std::process::exit(1);
    };

    let config = build_config(
        db,
        access_secret,
        refresh_secret,
        &public_origin,
        args.rotation,
        args.login_rate,
        args.renew_rate,
    );
    let app = create_app(&config);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!(address = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        });

    let local_addr = listener.local_addr().unwrap_or_else(|e| {
        error!(error = %e, "Failed to read local address");
        std::process::exit(1);
    });

    info!(address = %local_addr, "Listening");

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(e) = axum::serve(listener, make_service).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
