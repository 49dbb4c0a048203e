use std::path::PathBuf;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tracing::*;

use gateway_operator::client::KubeClusterClient;
use gateway_operator::config::{parse_duration, OperatorConfig, DEFAULT_CONTROLLER_NAME, OPERATOR_NAME};
use gateway_operator::leader::{default_identity, LeaderElector};
use gateway_operator::telemetry::{self, LogFormat};
use gateway_operator::{bootstrap, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Only Gateways whose GatewayClass names this controller are reconciled
    #[arg(long, env = "CONTROLLER_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    controller_name: String,

    /// Secret holding the CA that signs DataPlane certificates
    #[arg(long, env = "CLUSTER_CA_SECRET", default_value = "gateway-operator-ca")]
    cluster_ca_secret: String,

    #[arg(long, env = "POD_NAMESPACE")]
    cluster_ca_secret_namespace: String,

    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,

    #[arg(long, env = "NO_LEADER_ELECTION")]
    no_leader_election: bool,

    /// Name of the Lease used for leader election
    #[arg(long, default_value = "a7feedc84.gateway-operator.dev")]
    leader_election_id: String,

    #[arg(
        long,
        env = "WEBHOOK_CERT_DIR",
        default_value = "/tmp/k8s-webhook-server/serving-certs"
    )]
    webhook_cert_dir: PathBuf,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_controller_gateway: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_controller_dataplane: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_controller_controlplane: bool,

    /// Objects of one kind reconciled concurrently
    #[arg(long, default_value_t = 4)]
    max_concurrent_reconciles: u16,

    /// Deadline for a single reconcile pass
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    reconcile_timeout: Duration,

    #[arg(long, env = "CONTROLLER_DEVELOPMENT_MODE")]
    development_mode: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Arguments {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            controller_name: self.controller_name.clone(),
            cluster_ca_secret: self.cluster_ca_secret.clone(),
            cluster_ca_secret_namespace: self.cluster_ca_secret_namespace.clone(),
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            reconcile_timeout: self.reconcile_timeout,
            gateway_controller_enabled: self.enable_controller_gateway,
            dataplane_controller_enabled: self.enable_controller_dataplane,
            controlplane_controller_enabled: self.enable_controller_controlplane,
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();
    telemetry::init(args.log_format, args.development_mode)?;

    let config = args.operator_config();
    let client = Client::try_default().await?;
    let cluster = KubeClusterClient::new(client.clone(), OPERATOR_NAME);

    bootstrap::ensure_cluster_ca(
        &cluster,
        &config.cluster_ca_secret,
        &config.cluster_ca_secret_namespace,
    )
    .await?;
    if let Some(certs) = bootstrap::webhook_certificates(&args.webhook_cert_dir) {
        info!("Webhook serving certificates found at {}", certs.cert.display());
    }

    let bind_address = args.metrics_bind_address.clone();
    let leader_election_id = (!args.no_leader_election).then(|| args.leader_election_id.clone());

    // Initiatilize Kubernetes controller state
    let state = State::default();
    let controller = {
        let state = state.clone();
        async move {
            if let Some(lease_name) = leader_election_id {
                let elector = LeaderElector::new(
                    cluster,
                    &lease_name,
                    &config.cluster_ca_secret_namespace,
                    default_identity(),
                );
                let work = gateway_operator::run(client, state.clone(), config);
                elector.lead(&state, work).await;
            } else {
                state.diagnostics.write().await.leader = true;
                gateway_operator::run(client, state, config).await;
            }
        }
    };
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&bind_address)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
