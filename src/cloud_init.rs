//! Cloud-init payload rendering. Treated as an opaque string by the rest
//! of the core — the Provisioner only calls
//! [`render`] and forwards the result verbatim to `CloudApi::provision_host`.

use handlebars::Handlebars;
use serde::Serialize;
use thiserror::Error;

const TEMPLATE: &str = include_str!("cloud_init.yaml.hbs");

#[derive(Debug, Error)]
pub enum CloudInitError {
    #[error("failed to render cloud-init template: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("failed to compile cloud-init template: {0}")]
    Template(#[from] handlebars::TemplateError),
}

#[derive(Serialize)]
pub struct CloudInitParams<'a> {
    pub public_key: &'a str,
    pub data_volume_mount_point: &'a str,
    pub docker_tcp_port: u16,
    pub keep_alive_port: u16,
}

/// Renders the opaque cloud-init user-data string.
pub fn render(params: &CloudInitParams<'_>) -> Result<String, CloudInitError> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_template_string("cloud-init", TEMPLATE)?;
    Ok(handlebars.render("cloud-init", params)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_with_all_parameters_substituted() {
        let params = CloudInitParams {
            public_key: "ssh-ed25519 AAAA test@dockbridge",
            data_volume_mount_point: "/var/lib/docker",
            docker_tcp_port: 2376,
            keep_alive_port: 8080,
        };
        let rendered = render(&params).unwrap();
        assert!(rendered.contains("ssh-ed25519 AAAA test@dockbridge"));
        assert!(rendered.contains("/var/lib/docker"));
        assert!(rendered.contains("2376"));
        assert!(rendered.contains("8080"));
    }
}
