//! Project-level operations over the lifecycle engine.
//!
//! Services run in dependency order. Services of the same dependency level
//! are handled concurrently, bounded by a semaphore; a failed service is
//! reported and its dependents are skipped while unrelated services go on.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cdbox_core::container::{ContainerStatus, PortMapping};
use cdbox_core::error::{BoxError, Result};
use cdbox_core::labels::ComposeLabels;
use cdbox_core::log::LogEntry;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Semaphore, SemaphorePermit};

use super::fingerprint::config_hash;
use super::model::Condition;
use super::project::Project;
use crate::client::image::ImageReference;
use crate::client::ImageInfo;
use crate::lifecycle::ps::format_ports;
use crate::lifecycle::{human_duration, Container, ContainerLocks, ContainerManager, CreateRequest, RemoveOptions};
use crate::logging::consumer::LogQuery;
use crate::spec::PullPolicy;

/// Services handled at once when no bound is configured.
pub const DEFAULT_PARALLELISM: usize = 8;

/// What happened to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Recreated,
    Started,
    /// Already running and up to date.
    Running,
    Stopped,
    Restarted,
    Killed,
    Paused,
    Unpaused,
    Removed,
    Built,
    Pulled,
    Pushed,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Created => "Created",
            Action::Recreated => "Recreated",
            Action::Started => "Started",
            Action::Running => "Running",
            Action::Stopped => "Stopped",
            Action::Restarted => "Restarted",
            Action::Killed => "Killed",
            Action::Paused => "Paused",
            Action::Unpaused => "Unpaused",
            Action::Removed => "Removed",
            Action::Built => "Built",
            Action::Pulled => "Pulled",
            Action::Pushed => "Pushed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// `Container demo-web-1`, `Network demo_default`, ...
    pub resource: String,
    pub action: Action,
}

impl Change {
    fn container(c: &Container, action: Action) -> Self {
        Self {
            resource: format!("Container {}", c.name()),
            action,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {}", self.resource, self.action)
    }
}

/// Outcome of a project operation: what changed and what failed.
#[derive(Debug, Default)]
pub struct Report {
    pub changes: Vec<Change>,
    /// `(service or resource, error)`
    pub failed: Vec<(String, BoxError)>,
}

impl Report {
    /// Whether anything beyond confirming running containers happened.
    pub fn changed(&self) -> bool {
        self.changes.iter().any(|c| c.action != Action::Running)
    }

    fn absorb(&mut self, other: Report) {
        self.changes.extend(other.changes);
        self.failed.extend(other.failed);
    }

    fn record(&mut self, what: &str, res: Result<Vec<Change>>) {
        match res {
            Ok(changes) => self.changes.extend(changes),
            Err(e) => self.failed.push((what.to_string(), e)),
        }
    }

    /// The changes, or one error naming every failure.
    pub fn into_result(self) -> Result<Vec<Change>> {
        if self.failed.is_empty() {
            return Ok(self.changes);
        }
        if self.failed.len() == 1 && matches!(self.failed[0].1, BoxError::Cancelled) {
            return Err(BoxError::Cancelled);
        }
        let lines: Vec<String> = self.failed.iter().map(|(what, e)| format!("{what}: {e}")).collect();
        Err(BoxError::Other(lines.join("\n")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Services to bring up; all when empty.
    pub services: Vec<String>,
    /// Rebuild images of services with a build section.
    pub build: bool,
    /// Never build, even when the image is missing.
    pub no_build: bool,
    /// Overrides the services' pull policies.
    pub pull: Option<PullPolicy>,
    pub force_recreate: bool,
    pub no_recreate: bool,
    pub no_deps: bool,
    /// Create only.
    pub no_start: bool,
    /// Grace period when stopping containers to recreate them.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct DownOptions {
    /// Also remove declared volumes and anonymous volumes.
    pub volumes: bool,
    pub remove_orphans: bool,
    pub timeout: Option<Duration>,
}

/// One `compose ps` row; field names are the `--format` keys.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComposePsRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: String,
    pub service: String,
    pub created: String,
    pub state: String,
    pub status: String,
    pub ports: String,
}

/// One `compose images` row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComposeImageRow {
    pub container: String,
    pub repository: String,
    pub tag: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub size: u64,
}

fn service_of(c: &Container) -> &str {
    c.labels.compose.as_ref().map(|l| l.service.as_str()).unwrap_or_default()
}

fn number_of(c: &Container) -> u32 {
    c.labels.compose.as_ref().map(|l| l.number).unwrap_or(1)
}

pub struct Orchestrator<'a> {
    mgr: &'a ContainerManager,
    project: &'a Project,
    limit: Arc<Semaphore>,
    /// Serializes work on one service.
    locks: ContainerLocks,
}

impl<'a> Orchestrator<'a> {
    pub fn new(mgr: &'a ContainerManager, project: &'a Project) -> Self {
        Self {
            mgr,
            project,
            limit: Arc::new(Semaphore::new(DEFAULT_PARALLELISM)),
            locks: ContainerLocks::default(),
        }
    }

    pub fn with_parallelism(mut self, max: usize) -> Self {
        self.limit = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn project(&self) -> &Project {
        self.project
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.limit.acquire().await.map_err(|_| BoxError::Cancelled)
    }

    /// Project containers, optionally limited to `services`, in service
    /// order then replica number. Containers of services no longer in the
    /// file come last.
    pub async fn containers(&self, services: &[String]) -> Result<Vec<Container>> {
        let order = self.project.order();
        let rank = |c: &Container| {
            (
                order.iter().position(|s| s == service_of(c)).unwrap_or(usize::MAX),
                number_of(c),
            )
        };
        let mut out: Vec<Container> = self
            .mgr
            .containers()
            .await?
            .into_iter()
            .filter(|c| match &c.labels.compose {
                Some(l) => {
                    l.project == self.project.name && (services.is_empty() || services.contains(&l.service))
                }
                None => false,
            })
            .collect();
        out.sort_by_key(|c| rank(c));
        Ok(out)
    }

    async fn service_containers(&self, service: &str) -> Result<Vec<Container>> {
        self.containers(&[service.to_string()]).await
    }

    /// Project containers grouped by service, in dependency order.
    async fn groups(&self, services: &[String]) -> Result<Vec<Vec<Container>>> {
        let mut groups: Vec<Vec<Container>> = Vec::new();
        for c in self.containers(services).await? {
            match groups.last_mut() {
                Some(g) if service_of(&g[0]) == service_of(&c) => g.push(c),
                _ => groups.push(vec![c]),
            }
        }
        Ok(groups)
    }

    /// Run `f` on every container concurrently.
    async fn each<'c, F, Fut>(&self, containers: &'c [Container], action: Action, f: F) -> Report
    where
        F: Fn(&'c Container) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let runs = containers.iter().map(|c| {
            let fut = f(c);
            async move {
                let res = match self.permit().await {
                    Ok(_permit) => fut.await,
                    Err(e) => Err(e),
                };
                (c, res)
            }
        });
        let mut report = Report::default();
        for (c, res) in join_all(runs).await {
            match res {
                Ok(()) => report.changes.push(Change::container(c, action)),
                Err(e) => report.failed.push((format!("container {}", c.name()), e)),
            }
        }
        report
    }

    fn ensure_networks(&self, services: &[String]) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        for req in self.project.owned_networks(services)? {
            match self.mgr.networks().get(&req.name) {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            let name = req.name.clone();
            self.mgr.networks().create(req)?;
            changes.push(Change {
                resource: format!("Network {name}"),
                action: Action::Created,
            });
        }
        Ok(changes)
    }

    fn ensure_volumes(&self) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        for (key, decl) in &self.project.file.volumes {
            if decl.as_ref().map_or(false, |d| d.external) {
                let name = self.project.volume_name(key)?;
                if !self.mgr.volumes().exists(&name) {
                    return Err(BoxError::not_found("external volume", name));
                }
            }
        }
        for (name, labels) in self.project.owned_volumes()? {
            if self.mgr.volumes().exists(&name) {
                continue;
            }
            self.mgr.volumes().create(&name, labels)?;
            changes.push(Change {
                resource: format!("Volume {name}"),
                action: Action::Created,
            });
        }
        Ok(changes)
    }

    async fn build_service(&self, service: &str, no_cache: bool) -> Result<Option<ImageInfo>> {
        let Some(mut req) = self.project.build_request(service)? else {
            return Ok(None);
        };
        req.no_cache = no_cache;
        tracing::info!(service, image = ?req.tags, "building");
        let built = self.mgr.services().build_image(self.mgr.store(), &req).await?;
        let name = req.tags.first().or(built.first()).cloned().unwrap_or_default();
        Ok(Some(self.mgr.services().images.get(&name).await?))
    }

    /// Build or pull the image of one service.
    async fn prepare_image(&self, service: &str, opts: &UpOptions) -> Result<(ImageInfo, Vec<Change>)> {
        let _permit = self.permit().await?;
        let svc = self.project.service(service)?;
        let image = self.project.image_name(service)?;
        let policy = self.project.pull_policy(service)?;
        let images = &self.mgr.services().images;

        let buildable = svc.build.is_some() && !opts.no_build;
        let must_build = buildable
            && (opts.build
                || policy.is_none()
                || matches!(images.get(&image).await, Err(ref e) if e.is_not_found()));
        if must_build {
            if let Some(info) = self.build_service(service, false).await? {
                let change = Change {
                    resource: format!("Image {image}"),
                    action: Action::Built,
                };
                return Ok((info, vec![change]));
            }
        }
        let policy = opts.pull.or(policy).unwrap_or(PullPolicy::Missing);
        let info = self.mgr.ensure_image(&image, policy, svc.platform.as_deref()).await?;
        Ok((info, Vec::new()))
    }

    async fn create_replica(
        &self,
        service: &str,
        number: u32,
        image: &ImageInfo,
        depends_on: &[String],
        hash: &str,
    ) -> Result<Container> {
        let req = CreateRequest {
            image: image.name.clone(),
            opts: self.project.create_options(service, number)?,
            compose: Some(ComposeLabels {
                project: self.project.name.clone(),
                service: service.to_string(),
                depends_on: depends_on.to_vec(),
                number,
                config_hash: hash.to_string(),
            }),
        };
        self.mgr.create(&req).await
    }

    async fn discard(&self, c: &Container, timeout: Option<Duration>, volumes: bool) -> Result<()> {
        self.mgr.stop(c.id(), timeout).await?;
        self.mgr
            .remove_container(c, RemoveOptions { force: true, volumes })
            .await
    }

    /// Wait until every dependency of `service` satisfies its condition.
    async fn wait_dependencies(&self, service: &str) -> Result<()> {
        let svc = self.project.service(service)?;
        for (dep, condition) in svc.dependencies() {
            let containers = self.service_containers(&dep).await?;
            if containers.is_empty() {
                return Err(BoxError::Precondition(format!(
                    "service {service} depends on {dep}, which has no containers"
                )));
            }
            for c in &containers {
                let res = match condition {
                    Condition::ServiceStarted => Ok(()),
                    Condition::ServiceHealthy => self.mgr.wait_healthy(c).await,
                    Condition::ServiceCompletedSuccessfully => match self.mgr.wait_container(c.id()).await {
                        Ok(exit) if exit.code == 0 => Ok(()),
                        Ok(exit) => Err(BoxError::Precondition(format!(
                            "service {dep} didn't complete successfully: exit {}",
                            exit.code
                        ))),
                        Err(e) => Err(e),
                    },
                };
                match res {
                    Ok(()) => {}
                    Err(BoxError::Cancelled) => return Err(BoxError::Cancelled),
                    Err(e) => {
                        return Err(BoxError::Precondition(format!(
                            "dependency {dep} of {service} not satisfied ({condition}): {e}"
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Reconcile one service against its declared state, then start it.
    async fn converge(&self, service: &str, image: &ImageInfo, opts: &UpOptions) -> Result<Vec<Change>> {
        let _guard = self.locks.lock(service).await;
        let svc = self.project.service(service)?;
        let depends_on: Vec<String> = svc.dependencies().into_iter().map(|(d, _)| d).collect();
        let hash = config_hash(svc, &image.digest, &depends_on)?;
        let replicas = svc.replicas();
        let existing = self.service_containers(service).await?;
        let mut changes = Vec::new();

        let mut current = Vec::new();
        {
            let _permit = self.permit().await?;
            for number in 1..=replicas {
                let found = existing.iter().find(|c| number_of(c) == number);
                let container = match found {
                    None => {
                        let c = self.create_replica(service, number, image, &depends_on, &hash).await?;
                        changes.push(Change::container(&c, Action::Created));
                        c
                    }
                    Some(c) => {
                        let stale = c
                            .labels
                            .compose
                            .as_ref()
                            .map_or(true, |l| l.config_hash != hash);
                        if opts.force_recreate || (stale && !opts.no_recreate) {
                            tracing::debug!(service, container = %c.name(), stale, "recreating");
                            self.discard(c, opts.timeout, false).await?;
                            let c = self.create_replica(service, number, image, &depends_on, &hash).await?;
                            changes.push(Change::container(&c, Action::Recreated));
                            c
                        } else {
                            c.clone()
                        }
                    }
                };
                current.push(container);
            }
            for c in existing.iter().filter(|c| number_of(c) > replicas) {
                self.discard(c, opts.timeout, false).await?;
                changes.push(Change::container(c, Action::Removed));
            }
        }

        if opts.no_start {
            return Ok(changes);
        }
        self.wait_dependencies(service).await?;
        let _permit = self.permit().await?;
        for c in current {
            let fresh = self.mgr.reload(c.id()).await?;
            if fresh.status().is_live() {
                changes.push(Change::container(&fresh, Action::Running));
            } else {
                self.mgr.start_container(&fresh, false, false).await?;
                changes.push(Change::container(&fresh, Action::Started));
            }
        }
        Ok(changes)
    }

    /// Create and start the project.
    pub async fn up(&self, opts: &UpOptions) -> Result<Report> {
        if opts.force_recreate && opts.no_recreate {
            return Err(BoxError::invalid("--force-recreate and --no-recreate are incompatible"));
        }
        let selected = self.project.select(&opts.services, !opts.no_deps)?;
        let mut report = Report::default();
        report.changes.extend(self.ensure_networks(&selected)?);
        report.changes.extend(self.ensure_volumes()?);

        let prepared = join_all(selected.iter().map(|s| self.prepare_image(s, opts))).await;
        let mut images: HashMap<&str, ImageInfo> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        for (service, res) in selected.iter().zip(prepared) {
            match res {
                Ok((info, changes)) => {
                    report.changes.extend(changes);
                    images.insert(service.as_str(), info);
                }
                Err(e) => {
                    failed.insert(service.clone());
                    report.failed.push((format!("service {service}"), e));
                }
            }
        }

        let wanted: BTreeSet<String> = selected.iter().cloned().collect();
        for level in self.project.graph().levels(&wanted)? {
            let mut runnable = Vec::new();
            for service in level {
                if failed.contains(&service) {
                    continue;
                }
                let blocked = self
                    .project
                    .graph()
                    .dependencies(&service)
                    .find(|d| failed.contains(*d))
                    .cloned();
                match (blocked, images.get(service.as_str())) {
                    (Some(dep), _) => {
                        report.failed.push((
                            format!("service {service}"),
                            BoxError::Precondition(format!("not started: dependency {dep} failed")),
                        ));
                        failed.insert(service);
                    }
                    (None, Some(image)) => runnable.push((service, image.clone())),
                    (None, None) => {}
                }
            }
            let results = join_all(runnable.iter().map(|(s, image)| self.converge(s, image, opts))).await;
            for ((service, _), res) in runnable.iter().zip(results) {
                if res.is_err() {
                    failed.insert(service.clone());
                }
                report.record(&format!("service {service}"), res);
            }
            // Containers of finished levels stay up; the caller owns the stop.
            if self.mgr.cancel_token().is_cancelled() {
                tracing::debug!(started = report.changes.len(), "up interrupted");
                return Err(BoxError::Cancelled);
            }
        }
        Ok(report)
    }

    /// `up --no-start`.
    pub async fn create(&self, opts: &UpOptions) -> Result<Report> {
        let opts = UpOptions {
            no_start: true,
            ..opts.clone()
        };
        self.up(&opts).await
    }

    /// Stop and remove project containers, then its networks and, with
    /// `volumes`, its volumes.
    pub async fn down(&self, opts: &DownOptions) -> Result<Report> {
        let mut report = Report::default();
        for group in self.groups(&[]).await?.into_iter().rev() {
            let service = service_of(&group[0]).to_string();
            if self.project.service(&service).is_err() && !opts.remove_orphans {
                tracing::warn!(service = %service, "found orphan containers; use --remove-orphans to remove them");
                continue;
            }
            let timeout = opts.timeout;
            let volumes = opts.volumes;
            let stopped = self.each(&group, Action::Removed, |c| self.discard(c, timeout, volumes)).await;
            report.absorb(stopped);
        }
        if !report.failed.is_empty() {
            return Ok(report);
        }

        let in_use = self.mgr.networks_in_use().await?;
        for name in self.project.all_owned_network_names()? {
            match self.mgr.networks().remove(&name, &in_use) {
                Ok(()) => report.changes.push(Change {
                    resource: format!("Network {name}"),
                    action: Action::Removed,
                }),
                Err(e) if e.is_not_found() => {}
                Err(e) => report.failed.push((format!("network {name}"), e)),
            }
        }
        if opts.volumes {
            for (name, _) in self.project.owned_volumes()? {
                match self.mgr.volumes().delete(&name) {
                    Ok(()) => report.changes.push(Change {
                        resource: format!("Volume {name}"),
                        action: Action::Removed,
                    }),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => report.failed.push((format!("volume {name}"), e)),
                }
            }
        }
        Ok(report)
    }

    /// Start existing containers in dependency order.
    pub async fn start(&self, services: &[String]) -> Result<Report> {
        let mut report = Report::default();
        for group in self.groups(services).await? {
            let service = service_of(&group[0]).to_string();
            if let Err(e) = self.wait_dependencies(&service).await {
                report.failed.push((format!("service {service}"), e));
                continue;
            }
            let idle: Vec<Container> = group.into_iter().filter(|c| !c.status().is_live()).collect();
            report.absorb(
                self.each(&idle, Action::Started, |c| async move {
                    self.mgr.start(c.id(), false, false).await.map(|_| ())
                })
                .await,
            );
        }
        Ok(report)
    }

    /// Stop containers in reverse dependency order.
    pub async fn stop(&self, services: &[String], timeout: Option<Duration>) -> Result<Report> {
        let mut report = Report::default();
        for group in self.groups(services).await?.into_iter().rev() {
            let live: Vec<Container> = group.into_iter().filter(|c| c.status().is_live()).collect();
            report.absorb(
                self.each(&live, Action::Stopped, |c| async move {
                    self.mgr.stop(c.id(), timeout).await.map(|_| ())
                })
                .await,
            );
        }
        Ok(report)
    }

    pub async fn restart(&self, services: &[String], timeout: Option<Duration>) -> Result<Report> {
        let mut report = Report::default();
        for group in self.groups(services).await? {
            report.absorb(
                self.each(&group, Action::Restarted, |c| async move {
                    self.mgr.restart(c.id(), timeout).await.map(|_| ())
                })
                .await,
            );
        }
        Ok(report)
    }

    pub async fn kill(&self, services: &[String], signal: Option<&str>) -> Result<Report> {
        let live: Vec<Container> = self
            .containers(services)
            .await?
            .into_iter()
            .filter(|c| c.status().is_live())
            .collect();
        Ok(self
            .each(&live, Action::Killed, |c| async move {
                self.mgr.kill(c.id(), signal).await.map(|_| ())
            })
            .await)
    }

    pub async fn pause(&self, services: &[String]) -> Result<Report> {
        let running: Vec<Container> = self
            .containers(services)
            .await?
            .into_iter()
            .filter(|c| c.status() == ContainerStatus::Running)
            .collect();
        Ok(self
            .each(&running, Action::Paused, |c| async move {
                self.mgr.pause(c.id()).await.map(|_| ())
            })
            .await)
    }

    pub async fn unpause(&self, services: &[String]) -> Result<Report> {
        let paused: Vec<Container> = self
            .containers(services)
            .await?
            .into_iter()
            .filter(|c| c.status() == ContainerStatus::Paused)
            .collect();
        Ok(self
            .each(&paused, Action::Unpaused, |c| async move {
                self.mgr.unpause(c.id()).await.map(|_| ())
            })
            .await)
    }

    /// Remove stopped containers; with `stop`, running ones are stopped first.
    pub async fn rm(&self, services: &[String], stop: bool, volumes: bool) -> Result<Report> {
        let mut report = Report::default();
        if stop {
            report.absorb(self.stop(services, None).await?);
        }
        let doomed: Vec<Container> = self
            .containers(services)
            .await?
            .into_iter()
            .filter(|c| stop || !c.status().is_live())
            .collect();
        report.absorb(
            self.each(&doomed, Action::Removed, |c| async move {
                self.mgr
                    .remove_container(c, RemoveOptions { force: stop, volumes })
                    .await
            })
            .await,
        );
        Ok(report)
    }

    /// Running containers, or all with `all`.
    pub async fn ps(&self, services: &[String], all: bool) -> Result<Vec<ComposePsRow>> {
        let now = Utc::now();
        Ok(self
            .containers(services)
            .await?
            .into_iter()
            .filter(|c| all || c.status().is_live())
            .map(|c| ComposePsRow {
                id: c.short_id().to_string(),
                name: c.name().to_string(),
                image: c.record.image.clone(),
                command: c.command(),
                service: service_of(&c).to_string(),
                created: format!("{} ago", human_duration(now - c.record.created_at)),
                state: c.status().to_string(),
                status: c.status_text(now),
                ports: format_ports(&c.labels.ports),
            })
            .collect())
    }

    /// Logs of every selected container, each entry tagged with its
    /// container name. Following ends when every container has exited or
    /// the manager is cancelled.
    pub async fn logs(
        &self,
        services: &[String],
        query: &LogQuery,
        emit: &(dyn Fn(&str, &LogEntry) -> Result<()> + Sync),
    ) -> Result<()> {
        let containers = self.containers(services).await?;
        let runs = containers
            .iter()
            .map(|c| self.mgr.logs(c.id(), query, move |entry| emit(c.name(), entry)));
        join_all(runs).await.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Process IDs of every running container.
    pub async fn top(&self, services: &[String]) -> Result<Vec<(String, Vec<u32>)>> {
        let mut out = Vec::new();
        for c in self.containers(services).await? {
            if c.status().is_live() {
                out.push((c.name().to_string(), self.mgr.services().tasks.pids(c.id()).await?));
            }
        }
        Ok(out)
    }

    /// Images used by the project's containers.
    pub async fn images(&self, services: &[String]) -> Result<Vec<ComposeImageRow>> {
        let mut out = Vec::new();
        for c in self.containers(services).await? {
            let info = match self.mgr.services().images.get(&c.record.image).await {
                Ok(info) => info,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let (repository, tag) = match ImageReference::parse(&info.name) {
                Ok(r) => {
                    let familiar = ImageReference {
                        tag: None,
                        digest: None,
                        ..r.clone()
                    }
                    .familiar();
                    (familiar, r.tag.unwrap_or_else(|| "<none>".to_string()))
                }
                Err(_) => ("<none>".to_string(), "<none>".to_string()),
            };
            out.push(ComposeImageRow {
                container: c.name().to_string(),
                repository,
                tag,
                id: info.id.trim_start_matches("sha256:").chars().take(12).collect(),
                size: info.size,
            });
        }
        Ok(out)
    }

    /// Public binding of `private_port` (`80` or `80/udp`) on replica `index`.
    pub async fn port(&self, service: &str, private_port: &str, index: u32) -> Result<PortMapping> {
        self.project.service(service)?;
        let container = self
            .service_containers(service)
            .await?
            .into_iter()
            .find(|c| number_of(c) == index)
            .ok_or_else(|| BoxError::not_found("container", self.project.container_name(service, index)))?;
        let filter = if private_port.contains('/') {
            private_port.to_string()
        } else {
            format!("{private_port}/tcp")
        };
        self.mgr
            .port(container.id(), Some(&filter))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BoxError::not_found("port mapping", filter))
    }

    /// The resolved file as YAML.
    pub fn config(&self) -> Result<String> {
        let mut file = self.project.file.clone();
        file.name = Some(self.project.name.clone());
        Ok(serde_yaml::to_string(&file)?)
    }

    /// Build the images of services with a build section.
    pub async fn build(&self, services: &[String], no_cache: bool) -> Result<Report> {
        let selected = self.project.select(services, false)?;
        let mut report = Report::default();
        for service in selected {
            let res = self.build_service(&service, no_cache).await.map(|built| {
                built
                    .map(|info| Change {
                        resource: format!("Image {}", info.name),
                        action: Action::Built,
                    })
                    .into_iter()
                    .collect()
            });
            report.record(&format!("service {service}"), res);
        }
        Ok(report)
    }

    /// Pull the images of services that name one.
    pub async fn pull(&self, services: &[String]) -> Result<Report> {
        let selected = self.project.select(services, false)?;
        let targets: Vec<(String, String)> = selected
            .into_iter()
            .filter_map(|s| {
                let svc = self.project.service(&s).ok()?;
                svc.image.clone().map(|image| (s, image))
            })
            .collect();
        let runs = targets.iter().map(|(service, image)| async move {
            let _permit = self.permit().await?;
            let platform = self.project.service(service)?.platform.clone();
            self.mgr.pull_image(image, platform.as_deref()).await?;
            Ok::<_, BoxError>(vec![Change {
                resource: format!("Image {image}"),
                action: Action::Pulled,
            }])
        });
        let mut report = Report::default();
        for ((service, _), res) in targets.iter().zip(join_all(runs).await) {
            report.record(&format!("service {service}"), res);
        }
        Ok(report)
    }

    /// Push the images of services that are built locally.
    pub async fn push(&self, services: &[String]) -> Result<Report> {
        let mut report = Report::default();
        for service in self.project.select(services, false)? {
            if self.project.service(&service)?.build.is_none() {
                continue;
            }
            let image = self.project.image_name(&service)?;
            let opts = crate::client::PullOptions {
                platform: None,
                insecure: self.mgr.config().insecure_registry,
            };
            let res = self
                .mgr
                .services()
                .images
                .push(&image, &opts)
                .await
                .map(|()| {
                    vec![Change {
                        resource: format!("Image {image}"),
                        action: Action::Pushed,
                    }]
                });
            report.record(&format!("service {service}"), res);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::client::ImageConfig;
    use crate::compose::model::ComposeFile;
    use crate::lifecycle::testutil::manager;

    fn project(yaml: &str) -> Project {
        let file: ComposeFile = serde_yaml::from_str(yaml).unwrap();
        Project::new("demo", PathBuf::from("/srv/demo"), file).unwrap()
    }

    const TWO_TIER: &str = r#"
services:
  db:
    image: alpine
    command: sleep 3600
    depends_on: [cache]
    volumes: [dbdata:/var/lib/db]
  cache:
    image: alpine
    command: sleep 3600
volumes:
  dbdata:
"#;

    #[tokio::test]
    async fn test_up_is_idempotent_and_down_cleans_up() {
        let (fake, mgr) = manager();
        let p = project(TWO_TIER);
        let orch = Orchestrator::new(&mgr, &p);

        let first = orch.up(&UpOptions::default()).await.unwrap();
        assert!(first.failed.is_empty(), "{:?}", first.failed);
        let summary: Vec<String> = first.changes.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            summary,
            vec![
                "Network demo_default  Created",
                "Volume demo_dbdata  Created",
                "Container demo-cache-1  Created",
                "Container demo-cache-1  Started",
                "Container demo-db-1  Created",
                "Container demo-db-1  Started",
            ]
        );
        let ids: Vec<String> = orch.containers(&[]).await.unwrap().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(fake.calls().starts, ids);

        let second = orch.up(&UpOptions::default()).await.unwrap();
        assert!(!second.changed(), "{:?}", second.changes);
        let again: Vec<String> = orch.containers(&[]).await.unwrap().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, again);

        let down = orch
            .down(&DownOptions {
                volumes: true,
                ..DownOptions::default()
            })
            .await
            .unwrap();
        let summary: Vec<String> = down.changes.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            summary,
            vec![
                "Container demo-db-1  Removed",
                "Container demo-cache-1  Removed",
                "Network demo_default  Removed",
                "Volume demo_dbdata  Removed",
            ]
        );
        assert!(orch.containers(&[]).await.unwrap().is_empty());
        assert!(!mgr.volumes().exists("demo_dbdata"));
    }

    #[tokio::test]
    async fn test_changed_service_is_recreated_and_scaled() {
        let (_fake, mgr) = manager();
        let p = project(TWO_TIER);
        let orch = Orchestrator::new(&mgr, &p);
        orch.up(&UpOptions::default()).await.unwrap().into_result().unwrap();
        let old_db = orch.service_containers("db").await.unwrap()[0].id().to_string();

        let changed = project(&TWO_TIER.replace(
            "    depends_on: [cache]",
            "    depends_on: [cache]\n    environment: [MODE=replica]\n    deploy: {replicas: 2}",
        ));
        let orch = Orchestrator::new(&mgr, &changed);
        let report = orch.up(&UpOptions::default()).await.unwrap();
        let summary: Vec<String> = report.changes.iter().map(|c| c.to_string()).collect();
        assert!(summary.contains(&"Container demo-cache-1  Running".to_string()));
        assert!(summary.contains(&"Container demo-db-1  Recreated".to_string()));
        assert!(summary.contains(&"Container demo-db-2  Created".to_string()));
        let dbs = orch.service_containers("db").await.unwrap();
        assert_eq!(dbs.len(), 2);
        assert_ne!(dbs[0].id(), old_db);

        let base = project(TWO_TIER);
        let no_recreate = Orchestrator::new(&mgr, &base);
        let report = no_recreate
            .up(&UpOptions {
                no_recreate: true,
                ..UpOptions::default()
            })
            .await
            .unwrap();
        let summary: Vec<String> = report.changes.iter().map(|c| c.to_string()).collect();
        assert!(summary.contains(&"Container demo-db-2  Removed".to_string()));
        assert!(!summary.iter().any(|s| s.ends_with("Recreated")));
    }

    #[tokio::test]
    async fn test_dependency_gates() {
        let (fake, mgr) = manager();
        let p = project(
            r#"
services:
  migrate:
    image: alpine
    command: sh -c "exit 3"
  cache:
    image: alpine
    command: sleep 3600
    healthcheck:
      test: ["CMD", "true"]
      interval: 1s
  api:
    image: alpine
    command: sleep 3600
    depends_on:
      cache: {condition: service_healthy}
  worker:
    image: alpine
    command: sleep 3600
    depends_on:
      migrate: {condition: service_completed_successfully}
  ui:
    image: alpine
    command: sleep 3600
    depends_on: [worker]
"#,
        );
        fake.push_exec_codes(&[0]);
        let orch = Orchestrator::new(&mgr, &p);
        let report = orch.up(&UpOptions::default()).await.unwrap();

        let failed: Vec<&str> = report.failed.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(failed, vec!["service worker", "service ui"]);
        assert!(report.failed[0].1.to_string().contains("exit 3"));
        assert!(report.failed[1].1.to_string().contains("dependency worker failed"));

        let running: Vec<String> = orch.ps(&[], false).await.unwrap().into_iter().map(|r| r.service).collect();
        assert_eq!(running, vec!["cache", "api"]);
        let all = orch.ps(&[], true).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(report.into_result().unwrap_err().to_string().contains("service ui"));
    }

    #[tokio::test]
    async fn test_interrupted_up_stops_started_level() {
        let (fake, mgr) = manager();
        let token = tokio_util::sync::CancellationToken::new();
        let mgr = mgr.with_cancel(token.clone());
        let p = project(
            r#"
services:
  cache:
    image: alpine
    command: sleep 3600
    healthcheck:
      test: ["CMD", "true"]
      interval: 1s
      retries: 100
  db:
    image: alpine
    command: sleep 3600
    depends_on:
      cache: {condition: service_healthy}
"#,
        );
        // Keep cache in `starting` so db blocks on it.
        fake.push_exec_codes(&[1; 32]);
        let watcher = fake.clone();
        let interrupt = tokio::spawn(async move {
            while watcher.calls().starts.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            token.cancel();
        });

        let orch = Orchestrator::new(&mgr, &p);
        let err = orch.up(&UpOptions::default()).await.unwrap_err();
        assert!(matches!(err, BoxError::Cancelled), "{err}");
        interrupt.await.unwrap();

        let shutdown = ContainerManager::new(fake.services(), mgr.config().clone(), mgr.namespace());
        let stopper = Orchestrator::new(&shutdown, &p);
        let running: Vec<String> = stopper.ps(&[], false).await.unwrap().into_iter().map(|r| r.service).collect();
        assert_eq!(running, vec!["cache"]);

        let stopped = stopper.stop(&[], None).await.unwrap().into_result().unwrap();
        let summary: Vec<String> = stopped.iter().map(|c| c.to_string()).collect();
        assert_eq!(summary, vec!["Container demo-cache-1  Stopped"]);
        assert!(stopper.ps(&[], false).await.unwrap().is_empty());
        assert_eq!(fake.calls().kills[0].1, libc::SIGTERM);
    }

    #[tokio::test]
    async fn test_build_only_service_and_project_ops() {
        let (fake, mgr) = manager();
        let p = project("services:\n  app:\n    build: ./app\n    command: sleep 3600\n    ports: [\"8080:80\"]\n");
        let orch = Orchestrator::new(&mgr, &p);
        let report = orch.up(&UpOptions::default()).await.unwrap().into_result().unwrap();
        assert!(report.iter().any(|c| c.action == Action::Built));
        let builds = fake.calls().builds;
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].context, PathBuf::from("/srv/demo/app"));

        let again = orch.up(&UpOptions::default()).await.unwrap();
        assert!(!again.changed());
        assert_eq!(fake.calls().builds.len(), 1);

        orch.pause(&[]).await.unwrap().into_result().unwrap();
        let paused = orch.ps(&[], false).await.unwrap();
        assert_eq!(paused[0].state, "paused");
        orch.unpause(&[]).await.unwrap().into_result().unwrap();

        let port = orch.port("app", "80", 1).await.unwrap();
        assert_eq!(port.host_port, 8080);
        assert!(orch.port("app", "81", 1).await.unwrap_err().is_not_found());

        let top = orch.top(&[]).await.unwrap();
        assert_eq!(top, vec![("demo-app-1".to_string(), vec![4242])]);
        let images = orch.images(&[]).await.unwrap();
        assert_eq!(images[0].repository, "demo-app");

        orch.stop(&[], None).await.unwrap().into_result().unwrap();
        assert!(orch.ps(&[], false).await.unwrap().is_empty());
        let removed = orch.rm(&[], false, false).await.unwrap().into_result().unwrap();
        assert_eq!(removed.len(), 1);

        orch.push(&[]).await.unwrap().into_result().unwrap();
        assert_eq!(fake.calls().pushes.len(), 1);
        assert!(orch.config().unwrap().contains("name: demo"));
    }

    #[tokio::test]
    async fn test_pull_uses_service_images() {
        let (fake, mgr) = manager();
        fake.add_remote_image("redis:7", ImageConfig::default());
        let p = project("services:\n  cache:\n    image: redis:7\n  local:\n    build: .\n");
        let orch = Orchestrator::new(&mgr, &p);
        orch.pull(&[]).await.unwrap().into_result().unwrap();
        assert_eq!(fake.calls().pulls.len(), 1);
    }
}
