use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use url::Url;

/// Commandline overrides for the layered configuration.
#[derive(Debug, Parser)]
#[command(name = "storewatch", about = "Object storage latency monitoring service")]
pub(crate) struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(short, long)]
    address: Option<SocketAddr>,

    /// Directory for the sled repo
    #[arg(long)]
    repo_path: Option<PathBuf>,

    /// Address for the prometheus scrape endpoint
    #[arg(long)]
    prometheus_address: Option<SocketAddr>,

    /// OpenTelemetry collector url
    #[arg(long)]
    opentelemetry_url: Option<Url>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct Configuration {
    pub(crate) server: Server,

    pub(crate) tracing: Tracing,

    pub(crate) metrics: Metrics,

    pub(crate) repo: Repo,

    pub(crate) probes: Probes,

    pub(crate) endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct Server {
    pub(crate) address: SocketAddr,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct Tracing {
    pub(crate) service_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) opentelemetry_url: Option<Url>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct Metrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) prometheus_address: Option<SocketAddr>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct Repo {
    pub(crate) path: PathBuf,

    pub(crate) cache_capacity: u64,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct Probes {
    /// Anchor regions whose operation cycle is tracked per origin. Must
    /// name configured endpoints.
    pub(crate) anchor_regions: Vec<String>,

    pub(crate) timeout_seconds: u64,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct Endpoint {
    pub(crate) label: String,

    #[serde(flatten)]
    pub(crate) store: EndpointStore,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub(crate) enum EndpointStore {
    Filesystem { path: PathBuf },
    ObjectStorage(ObjectStorage),
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct ObjectStorage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) endpoint: Option<Url>,

    pub(crate) bucket_name: String,

    pub(crate) region: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) access_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) secret_key: Option<String>,
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "snake_case")]
struct Defaults {
    server: Server,
    tracing: Tracing,
    metrics: Metrics,
    repo: Repo,
    probes: Probes,
    endpoints: Vec<Endpoint>,
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            server: Server {
                address: ([0, 0, 0, 0], 8080).into(),
            },
            tracing: Tracing {
                service_name: "storewatch".to_string(),
                opentelemetry_url: None,
            },
            metrics: Metrics {
                prometheus_address: None,
            },
            repo: Repo {
                path: PathBuf::from("./storewatch-data/sled"),
                cache_capacity: 1024 * 1024 * 64,
            },
            probes: Probes {
                anchor_regions: vec!["DFW".to_string(), "LHR".to_string()],
                timeout_seconds: 30,
            },
            endpoints: vec![
                Endpoint {
                    label: "DFW".to_string(),
                    store: EndpointStore::Filesystem {
                        path: PathBuf::from("./storewatch-data/endpoints/dfw"),
                    },
                },
                Endpoint {
                    label: "LHR".to_string(),
                    store: EndpointStore::Filesystem {
                        path: PathBuf::from("./storewatch-data/endpoints/lhr"),
                    },
                },
            ],
        }
    }
}

pub(crate) fn configure() -> color_eyre::Result<Configuration> {
    build(Args::parse())
}

fn build(args: Args) -> color_eyre::Result<Configuration> {
    let mut builder = config::Config::builder()
        .add_source(config::Config::try_from(&Defaults::default())?);

    if let Some(config_file) = &args.config_file {
        builder = builder.add_source(config::File::from(config_file.clone()));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STOREWATCH")
            .separator("__")
            .try_parsing(true),
    );

    if let Some(address) = args.address {
        builder = builder.set_override("server.address", address.to_string())?;
    }

    if let Some(repo_path) = args.repo_path {
        builder = builder.set_override("repo.path", repo_path.display().to_string())?;
    }

    if let Some(prometheus_address) = args.prometheus_address {
        builder =
            builder.set_override("metrics.prometheus_address", prometheus_address.to_string())?;
    }

    if let Some(opentelemetry_url) = args.opentelemetry_url {
        builder =
            builder.set_override("tracing.opentelemetry_url", opentelemetry_url.to_string())?;
    }

    let configuration: Configuration = builder.build()?.try_deserialize()?;

    Ok(configuration)
}
