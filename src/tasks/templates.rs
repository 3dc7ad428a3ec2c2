//! Files written to remote hosts by the provisioning jobs

use anyhow::{Result, bail};

/// Default upstream when neither the request nor the domain names one
pub const DEFAULT_UPSTREAM: &str = "localhost:80";

/// Domain names are interpolated into shell commands, so only hostname characters pass
pub fn validate_domain_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && !name.starts_with(['-', '.'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        bail!("invalid domain name '{name}'");
    }
    Ok(())
}

fn validate_upstream(upstream: &str) -> Result<()> {
    if upstream.is_empty()
        || upstream
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '\'' | '"'))
    {
        bail!("invalid upstream '{upstream}'");
    }
    Ok(())
}

/// Reverse-proxy server block for one domain
///
/// TLS is not configured here. When requested, certbot rewrites the block after
/// the certificate is issued.
pub fn nginx_site(domain: &str, upstream: &str) -> Result<String> {
    validate_domain_name(domain)?;
    validate_upstream(upstream)?;

    let target = if upstream.contains("://") {
        upstream.to_string()
    } else {
        format!("http://{upstream}")
    };

    Ok(format!(
        r#"server {{
    listen 80;
    listen [::]:80;
    server_name {domain};

    access_log /var/log/nginx/{domain}.access.log;
    error_log /var/log/nginx/{domain}.error.log;

    location / {{
        proxy_pass {target};
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
    }}
}}
"#
    ))
}

/// systemd unit running the metrics agent's web server
pub fn agent_unit(port: u16) -> String {
    format!(
        "[Unit]
Description=Glances Web Server
After=network.target

[Service]
Type=simple
User=nobody
Group=nogroup
ExecStart=/usr/local/bin/glances -w -p {port} -B 0.0.0.0 --disable-check-update
Restart=always
RestartSec=3

[Install]
WantedBy=multi-user.target
"
    )
}
