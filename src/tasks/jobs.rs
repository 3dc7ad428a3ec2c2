//! The provisioning jobs
//!
//! Each job opens one session, runs its steps in order and always disconnects,
//! whether the steps succeeded or not. Milestones are the progress values
//! reported after each step.

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use super::context::JobContext;
use super::templates::{DEFAULT_UPSTREAM, agent_unit, nginx_site};
use crate::model::{DEFAULT_AGENT_PORT, Domain, Host, TaskKind};
use crate::remote::{RemoteConnector, RemoteSession, RemoteTarget};

const SITES_AVAILABLE: &str = "/etc/nginx/sites-available";
const SITES_ENABLED: &str = "/etc/nginx/sites-enabled";

/// Everything a job needs besides its context
pub struct JobInput<'a> {
    pub kind: TaskKind,
    pub host: &'a Host,
    pub domain: Option<&'a Domain>,
    pub params: &'a Value,
}

pub async fn run(
    ctx: &JobContext,
    connector: &dyn RemoteConnector,
    input: JobInput<'_>,
) -> Result<Value> {
    match input.kind {
        TaskKind::SshCheck => ssh_check(ctx, connector, input.host).await,
        TaskKind::DeployProxy => deploy_proxy(ctx, connector, input.host).await,
        TaskKind::InstallAgent => {
            let port = input
                .params
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(DEFAULT_AGENT_PORT);
            install_agent(ctx, connector, input.host, port).await
        }
        TaskKind::DeployDomain => {
            let domain = input.domain.context("deploy_domain requires a domain")?;
            let upstream = input
                .params
                .get("upstream")
                .and_then(Value::as_str)
                .or(domain.upstream.as_deref())
                .unwrap_or(DEFAULT_UPSTREAM);
            let ssl = input
                .params
                .get("ssl")
                .and_then(Value::as_bool)
                .unwrap_or(domain.ssl);
            deploy_domain(ctx, connector, input.host, &domain.name, upstream, ssl).await
        }
    }
}

/// Connect, run `steps`, then disconnect regardless of the outcome
macro_rules! in_session {
    ($ctx:expr, $connector:expr, $host:expr, |$session:ident| $steps:expr) => {{
        let mut session = $ctx
            .connect($connector, &RemoteTarget::from($host))
            .await?;
        let result = {
            let $session: &mut dyn RemoteSession = session.as_mut();
            $steps.await
        };
        $ctx.disconnect(session).await?;
        result
    }};
}

async fn ssh_check(ctx: &JobContext, connector: &dyn RemoteConnector, host: &Host) -> Result<Value> {
    let output = in_session!(ctx, connector, host, |session| async {
        ctx.reach(30).await?;
        let output = ctx
            .run(session, "echo 'SSH test successful'", ctx.timeouts.command)
            .await?;
        ctx.reach(70).await?;
        Ok::<_, anyhow::Error>(output)
    })?;
    ctx.reach(100).await?;

    Ok(json!({
        "success": true,
        "message": "SSH connection successful",
        "output": output.stdout.trim(),
    }))
}

async fn deploy_proxy(
    ctx: &JobContext,
    connector: &dyn RemoteConnector,
    host: &Host,
) -> Result<Value> {
    let install = ctx.timeouts.install;
    let command = ctx.timeouts.command;

    in_session!(ctx, connector, host, |session| async {
        ctx.reach(10).await?;

        ctx.run(session, "sudo apt update", install).await?;
        ctx.reach(25).await?;

        ctx.run(
            session,
            "sudo DEBIAN_FRONTEND=noninteractive apt install -y nginx",
            install,
        )
        .await?;
        ctx.reach(50).await?;

        ctx.run(
            session,
            &format!("sudo mkdir -p {SITES_AVAILABLE} {SITES_ENABLED}"),
            command,
        )
        .await?;
        ctx.reach(60).await?;

        ctx.run(session, "sudo systemctl enable nginx", command).await?;
        ctx.run(session, "sudo systemctl start nginx", command).await?;
        ctx.reach(75).await?;

        ctx.run(session, "sudo nginx -t", command).await?;
        ctx.reach(85).await?;

        ctx.run(session, "sudo systemctl reload nginx", command).await?;
        ctx.reach(95).await?;
        Ok::<_, anyhow::Error>(())
    })?;
    ctx.reach(100).await?;

    Ok(json!({
        "success": true,
        "message": "Nginx installed and configured successfully",
    }))
}

async fn install_agent(
    ctx: &JobContext,
    connector: &dyn RemoteConnector,
    host: &Host,
    port: u16,
) -> Result<Value> {
    let install = ctx.timeouts.install;
    let command = ctx.timeouts.command;

    in_session!(ctx, connector, host, |session| async {
        ctx.reach(10).await?;

        ctx.run(session, "sudo apt update", install).await?;
        ctx.reach(20).await?;

        ctx.run(
            session,
            "sudo DEBIAN_FRONTEND=noninteractive apt install -y python3 python3-pip",
            install,
        )
        .await?;
        ctx.reach(35).await?;

        ctx.run(session, "sudo pip3 install 'glances[web]'", install)
            .await?;
        ctx.reach(55).await?;

        ctx.upload(session, &agent_unit(port), "/tmp/glances.service")
            .await?;
        ctx.run(
            session,
            "sudo mv /tmp/glances.service /etc/systemd/system/glances.service",
            command,
        )
        .await?;
        ctx.reach(65).await?;

        ctx.run(session, "sudo systemctl daemon-reload", command)
            .await?;
        ctx.run(session, "sudo systemctl enable glances", command)
            .await?;
        ctx.run(session, "sudo systemctl start glances", command)
            .await?;
        ctx.reach(80).await?;

        let status = ctx
            .exec(session, "systemctl is-active glances", command)
            .await?;
        if status.stdout.trim() != "active" {
            bail!(
                "glances service is not active: {}",
                super::context::failure_detail(&status)
            );
        }
        ctx.reach(95).await?;
        Ok::<_, anyhow::Error>(())
    })?;
    ctx.reach(100).await?;

    Ok(json!({
        "success": true,
        "message": "Glances installed successfully",
        "port": port,
    }))
}

/// Pick the package manager command from `/etc/os-release`
fn nginx_install_command(os_release: &str) -> Option<&'static str> {
    let os = os_release.to_lowercase();
    if os.contains("ubuntu") || os.contains("debian") {
        Some("sudo apt update && sudo DEBIAN_FRONTEND=noninteractive apt install -y nginx")
    } else if ["centos", "rhel", "fedora", "rocky", "almalinux", "amzn"]
        .iter()
        .any(|name| os.contains(name))
    {
        Some("sudo yum install -y epel-release; sudo yum install -y nginx")
    } else {
        None
    }
}

async fn deploy_domain(
    ctx: &JobContext,
    connector: &dyn RemoteConnector,
    host: &Host,
    domain: &str,
    upstream: &str,
    ssl: bool,
) -> Result<Value> {
    let site = nginx_site(domain, upstream)?;
    ctx.info("nginx", format!("Generated configuration for {domain} -> {upstream}"))
        .await?;
    ctx.reach(20).await?;

    let install = ctx.timeouts.install;
    let command = ctx.timeouts.command;
    let available = format!("{SITES_AVAILABLE}/{domain}");
    let enabled = format!("{SITES_ENABLED}/{domain}");

    in_session!(ctx, connector, host, |session| async {
        ctx.reach(30).await?;

        let which = ctx.exec(session, "which nginx", command).await?;
        if !which.success() {
            let release = ctx.run(session, "cat /etc/os-release", command).await?;
            let Some(install_cmd) = nginx_install_command(&release.stdout) else {
                bail!("unsupported operating system, cannot install nginx");
            };
            ctx.run(session, install_cmd, install).await?;
        }
        ctx.reach(45).await?;

        let staged = format!("/tmp/{domain}.conf");
        ctx.upload(session, &site, &staged).await?;
        ctx.run(
            session,
            &format!("sudo mkdir -p {SITES_AVAILABLE} {SITES_ENABLED} && sudo mv {staged} {available}"),
            command,
        )
        .await?;
        ctx.reach(60).await?;

        ctx.run(session, &format!("sudo ln -sf {available} {enabled}"), command)
            .await?;
        ctx.reach(70).await?;

        ctx.run(session, "sudo nginx -t", command).await?;
        ctx.reach(80).await?;

        if ssl {
            ctx.run(
                session,
                &format!(
                    "sudo certbot --nginx -d {domain} --non-interactive --agree-tos \
                     --register-unsafely-without-email --redirect"
                ),
                install,
            )
            .await?;
            ctx.reach(90).await?;
        }

        ctx.run(session, "sudo systemctl reload nginx", command)
            .await?;
        ctx.reach(95).await?;
        Ok::<_, anyhow::Error>(())
    })?;
    ctx.reach(100).await?;

    Ok(json!({
        "success": true,
        "domain": domain,
        "ssl": ssl,
    }))
}
