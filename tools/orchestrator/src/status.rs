//! Status Reporter
//!
//! Pure rendering of per-service health into `status.json` and `ACCESS.md`.
//! Both are regenerated wholesale on every run.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use colored::*;
use reqwest::Url;
use warden_shared::fsutil::atomic_write;
use warden_shared::{
    HealthCheckResult, PlatformStatusSnapshot, Result, ServiceDescriptor, ServiceState, ServiceStatusEntry,
};

pub const STATUS_FILE: &str = "status.json";
pub const ACCESS_FILE: &str = "ACCESS.md";

pub struct StatusReporter;

impl StatusReporter {
    /// Build the machine-readable snapshot and the human summary.
    ///
    /// A service with no health result is reported down.
    pub fn render(
        descriptors: &[ServiceDescriptor],
        results: &[HealthCheckResult],
        generated_at: DateTime<Utc>,
    ) -> (PlatformStatusSnapshot, String) {
        let services = descriptors
            .iter()
            .map(|desc| {
                let result = results.iter().find(|r| r.service == desc.name);
                let url = Url::parse(&desc.health.url).ok();
                let ports = if desc.ports.is_empty() {
                    url.as_ref().and_then(Url::port_or_known_default).into_iter().collect()
                } else {
                    desc.ports.clone()
                };
                let local_url = url
                    .as_ref()
                    .map(|u| u.origin().ascii_serialization())
                    .unwrap_or_else(|| desc.health.url.clone());

                let (state, detail) = match result {
                    Some(r) if r.ready => (ServiceState::Up, None),
                    Some(r) => (ServiceState::Down, Some(r.last_response.to_string())),
                    None => (ServiceState::Down, Some("not probed".to_string())),
                };

                ServiceStatusEntry {
                    name: desc.name.clone(),
                    category: desc.category,
                    phase: desc.phase,
                    ports,
                    state,
                    local_url,
                    public_url: desc.public_url.clone(),
                    detail,
                }
            })
            .collect();

        let snapshot = PlatformStatusSnapshot { generated_at, services };
        let summary = access_summary(&snapshot);
        (snapshot, summary)
    }

    /// Replace `status.json` and `ACCESS.md` under `state_dir`
    pub fn write(state_dir: &Path, snapshot: &PlatformStatusSnapshot, summary: &str) -> Result<()> {
        atomic_write(&state_dir.join(STATUS_FILE), &serde_json::to_vec_pretty(snapshot)?)?;
        atomic_write(&state_dir.join(ACCESS_FILE), summary.as_bytes())
    }

    pub fn print_table(snapshot: &PlatformStatusSnapshot) {
        println!();
        println!("{}", "╔══════════════════════════════════════════════════════════════╗".cyan());
        println!("{}", "║                     Warden Platform Status                   ║".cyan());
        println!("{}", "╚══════════════════════════════════════════════════════════════╝".cyan());
        println!();
        println!(
            "{:<20} {:<10} {:<8} {:<30} {}",
            "SERVICE".bold(),
            "STATE".bold(),
            "PORT".bold(),
            "LOCAL".bold(),
            "PUBLIC".bold()
        );
        println!("{}", "─".repeat(80));

        for svc in &snapshot.services {
            let state = match svc.state {
                ServiceState::Up => "UP".green(),
                ServiceState::Down => "DOWN".red(),
            };
            println!(
                "{:<20} {:<10} {:<8} {:<30} {}",
                svc.name,
                state,
                join_ports(&svc.ports),
                svc.local_url,
                svc.public_url.as_deref().unwrap_or("-"),
            );
        }

        println!();
        println!(
            "{} of {} services up",
            snapshot.up_count().to_string().bold(),
            snapshot.services.len()
        );
        println!();
    }
}

fn join_ports(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",")
}

fn access_summary(snapshot: &PlatformStatusSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Platform Access\n");
    let _ = writeln!(out, "Generated {}\n", snapshot.generated_at.to_rfc3339());
    let _ = writeln!(out, "| Service | State | Port | Local | Public |");
    let _ = writeln!(out, "|---------|-------|------|-------|--------|");
    for svc in &snapshot.services {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} |",
            svc.name,
            svc.state,
            join_ports(&svc.ports),
            svc.local_url,
            svc.public_url.as_deref().unwrap_or("-")
        );
    }

    let down: Vec<&ServiceStatusEntry> = snapshot
        .services
        .iter()
        .filter(|s| s.state == ServiceState::Down)
        .collect();
    let _ = writeln!(out, "\n{} of {} services up.", snapshot.up_count(), snapshot.services.len());
    if !down.is_empty() {
        let _ = writeln!(out, "\n## Down\n");
        for svc in down {
            let _ = writeln!(out, "- {}: {}", svc.name, svc.detail.as_deref().unwrap_or("unknown"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_shared::{Phase, ProbeResponse};

    fn descriptors() -> Vec<ServiceDescriptor> {
        let mut core = ServiceDescriptor::native("core-api", Phase::Core, "./core-api", &[], "http://localhost:11000/healthz");
        core.public_url = Some("https://api.example.org".into());
        let aux = ServiceDescriptor::native("aux-tool", Phase::Auxiliary, "./aux", &[], "http://localhost:11010/status");
        vec![core, aux]
    }

    fn result(service: &str, ready: bool, last_response: ProbeResponse) -> HealthCheckResult {
        HealthCheckResult {
            service: service.into(),
            attempts: 1,
            ready,
            last_response,
        }
    }

    #[test]
    fn test_render_reports_each_service() {
        let results = vec![
            result("core-api", true, ProbeResponse::Status(200)),
            result("aux-tool", false, ProbeResponse::Error("connect failed: refused".into())),
        ];
        let (snapshot, summary) = StatusReporter::render(&descriptors(), &results, Utc::now());

        let core = snapshot.get("core-api").unwrap();
        assert_eq!(core.state, ServiceState::Up);
        assert_eq!(core.ports, vec![11000]);
        assert_eq!(core.local_url, "http://localhost:11000");
        let aux = snapshot.get("aux-tool").unwrap();
        assert_eq!(aux.state, ServiceState::Down);
        assert_eq!(aux.detail.as_deref(), Some("connect failed: refused"));

        assert!(summary.contains("| core-api | up | 11000 | http://localhost:11000 | https://api.example.org |"));
        assert!(summary.contains("- aux-tool: connect failed: refused"));
        assert!(summary.contains("1 of 2 services up."));
    }

    #[test]
    fn test_missing_result_is_down() {
        let (snapshot, _) = StatusReporter::render(&descriptors(), &[], Utc::now());
        assert_eq!(snapshot.up_count(), 0);
        assert_eq!(snapshot.get("core-api").unwrap().detail.as_deref(), Some("not probed"));
    }

    #[test]
    fn test_write_replaces_previous_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let stale = r#"{"generated_at":"2020-01-01T00:00:00Z","services":[]}"#;
        std::fs::write(dir.path().join(STATUS_FILE), stale).unwrap();

        let results = vec![result("core-api", true, ProbeResponse::Status(204))];
        let (snapshot, summary) = StatusReporter::render(&descriptors(), &results, Utc::now());
        StatusReporter::write(dir.path(), &snapshot, &summary).unwrap();

        let written: PlatformStatusSnapshot =
            serde_json::from_slice(&std::fs::read(dir.path().join(STATUS_FILE)).unwrap()).unwrap();
        assert_eq!(written, snapshot);
        assert_eq!(std::fs::read_to_string(dir.path().join(ACCESS_FILE)).unwrap(), summary);
    }
}
