use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Installs the global metrics recorder and serves it at `http://{address}/metrics`.
///
/// When an instance name is given it is attached to every series as the `instance_name`
/// label, which keeps horizontally scaled relays apart.
pub fn init_metrics(address: SocketAddr, instance_name: Option<String>) -> Result<(), BuildError> {
    let mut builder = PrometheusBuilder::new().with_http_listener(address);

    if let Some(instance_name) = instance_name {
        builder = builder.add_global_label("instance_name", instance_name);
    }

    builder.install()
}
