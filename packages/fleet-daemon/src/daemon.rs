//! The daemon main loop: single writer of the master inventory.
//!
//! Step 1: poll the application registry for one `new` executable.
//! Step 2: check write authorization for write requests.
//! Step 3: spawn a worker sub-process with the work area and, for write
//!         requests, the bounded mutation channel.
//! Step 4: drain mutation channels and apply each batch atomically.
//! Step 5: reap completed workers and sleep out the cycle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use fleet_inventory::{Entity, Inventory};
use fleet_master::{AppFilter, AppStatus, AppUpdate, MasterServer};

use crate::error::DaemonError;
use crate::events::{AppEvent, AppEventBus};
use crate::frame::MutationOp;
use crate::interrupt::{should_stop, InterruptMask};
use crate::worker::{spawn_worker, WorkerChild, EXEC_FILE};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Idle poll cycle
    pub cycle: Duration,
    /// Per-frame receive timeout while draining a child
    pub frame_timeout: Duration,
    /// Grace period between terminate and giving up on a child
    pub shutdown_grace: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(5),
            frame_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Invoked once per cycle with the master inventory (the dealer hook).
pub type CycleHook = Box<dyn FnMut(&mut Inventory) + Send>;

/// Single-threaded mutation loop over the master inventory.
pub struct Daemon {
    master: Arc<MasterServer>,
    inventory: Inventory,
    events: AppEventBus,
    mask: InterruptMask,
    shutdown: watch::Receiver<bool>,
    children: Vec<WorkerChild>,
    config: DaemonConfig,
    cycle_hook: Option<CycleHook>,
}

impl Daemon {
    pub fn new(
        master: Arc<MasterServer>,
        inventory: Inventory,
        events: AppEventBus,
        shutdown: watch::Receiver<bool>,
        config: DaemonConfig,
    ) -> Self {
        Self {
            master,
            inventory,
            events,
            mask: InterruptMask::new(),
            shutdown,
            children: Vec::new(),
            config,
            cycle_hook: None,
        }
    }

    /// Installs the per-cycle hook (the dealer runs here).
    pub fn set_cycle_hook(&mut self, hook: CycleHook) {
        self.cycle_hook = Some(hook);
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn inventory_mut(&mut self) -> &mut Inventory {
        &mut self.inventory
    }

    pub fn interrupt_mask(&self) -> InterruptMask {
        self.mask.clone()
    }

    /// Runs until the shutdown signal is observed (outside any mask), then
    /// terminates the remaining children.
    pub async fn run(&mut self) {
        tracing::info!("Started fleet daemon.");
        tracing::info!("Start polling for executables.");

        let mut first_wait = true;
        loop {
            if should_stop(&self.shutdown, &self.mask) {
                break;
            }

            let launched = match self.poll_one() {
                Ok(launched) => launched,
                Err(err) => {
                    tracing::error!("Error while polling for executables: {}", err);
                    false
                }
            };

            self.collect_children().await;

            if let Some(hook) = self.cycle_hook.as_mut() {
                hook(&mut self.inventory);
            }

            if launched {
                first_wait = true;
                continue;
            }

            if self.children.is_empty() && first_wait {
                tracing::info!("Waiting for executables.");
                first_wait = false;
            }

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.config.cycle) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.terminate_children().await;
        tracing::info!("Fleet daemon stopped.");
    }

    /// Claims the oldest `new` application, if any, and starts its worker.
    fn poll_one(&mut self) -> Result<bool, DaemonError> {
        let pending = self.master.get_applications(AppFilter {
            status: Some(AppStatus::New),
            ..Default::default()
        });
        let Some(app) = pending.into_iter().next() else {
            return Ok(false);
        };

        self.master.update_application(
            app.id,
            AppUpdate {
                status: Some(AppStatus::Run),
                ..Default::default()
            },
        )?;

        tracing::info!(
            "Found executable {} from user {} (write request: {})",
            app.title,
            app.user,
            app.write_request
        );

        let exec_path = Path::new(&app.path).join(EXEC_FILE);
        let content = match std::fs::read(&exec_path) {
            Ok(content) => content,
            Err(err) => {
                tracing::error!(
                    "Could not read executable of application {}: {}",
                    app.id,
                    err
                );
                self.finish_app(app.id, &app.path, AppStatus::Failed, Some(-1));
                return Ok(true);
            }
        };

        if app.write_request && !self.master.check_write_auth(&app.title, app.user_id, &content)
        {
            tracing::warn!(
                "Executable {} from user {} is not authorized for write access.",
                app.title,
                app.user
            );
            self.finish_app(app.id, &app.path, AppStatus::Failed, None);
            return Ok(true);
        }

        let inventory_dir = self
            .inventory
            .store()
            .map(|store| store.dir().to_path_buf());

        match spawn_worker(
            app.id,
            &app.user,
            Path::new(&app.path),
            inventory_dir.as_deref(),
            app.write_request,
        ) {
            Ok(child) => {
                self.children.push(child);
                self.events.publish(AppEvent {
                    app_id: app.id,
                    status: AppStatus::Run,
                    exit_code: None,
                    path: app.path.clone(),
                });
            }
            Err(err) => {
                tracing::error!("Could not start application {}: {}", app.id, err);
                self.finish_app(app.id, &app.path, AppStatus::Failed, Some(-1));
            }
        }
        Ok(true)
    }

    /// Scans the live children: honours kill requests, drains mutation
    /// channels, applies batches under the interrupt mask, reaps exits.
    async fn collect_children(&mut self) {
        let frame_timeout = self.config.frame_timeout;
        let mut index = 0;

        while index < self.children.len() {
            let app_id = self.children[index].app_id;

            let kill_requested = matches!(
                self.master.get_application(app_id).map(|app| app.status),
                Ok(AppStatus::Killed)
            );

            let (updated, deleted) = {
                let child = &mut self.children[index];

                if kill_requested {
                    tracing::info!("Kill requested for application {}", app_id);
                    let _ = child.child.start_kill();
                }

                let exited = !matches!(child.child.try_wait(), Ok(None));

                let mut updated: Vec<Entity> = Vec::new();
                let mut deleted: Vec<Entity> = Vec::new();
                if let Some(rx) = child.mutations.as_mut() {
                    // an exited child gets a final drain even if nothing is
                    // buffered yet; end of stream is "process exited and
                    // channel empty"
                    if !rx.is_empty() || exited {
                        // the child is wrapping up and wants to send us the
                        // list of updated objects
                        loop {
                            match timeout(frame_timeout, rx.recv()).await {
                                Ok(Some(frame)) => match frame.op {
                                    MutationOp::Update => updated.push(frame.entity),
                                    MutationOp::Delete => deleted.push(frame.entity),
                                },
                                Ok(None) => break,
                                Err(_elapsed) => {
                                    let alive = matches!(child.child.try_wait(), Ok(None));
                                    if !alive && rx.is_empty() {
                                        break;
                                    }
                                    // still trying to say something
                                }
                            }
                        }
                    }
                }
                (updated, deleted)
            };

            if !updated.is_empty() || !deleted.is_empty() {
                let _guard = self.mask.block();
                for entity in &updated {
                    if let Err(err) = self.inventory.update(entity, true) {
                        tracing::error!(
                            "Failed to apply update of {}: {}",
                            entity.describe(),
                            err
                        );
                    }
                }
                for entity in &deleted {
                    if let Err(err) = self.inventory.delete(entity, true) {
                        tracing::error!(
                            "Failed to apply deletion of {}: {}",
                            entity.describe(),
                            err
                        );
                    }
                }
            }

            let exit = {
                let child = &mut self.children[index];
                child.child.try_wait().ok().flatten()
            };

            match exit {
                Some(status) => {
                    let mut child = self.children.remove(index);
                    child.abort_reader();

                    let exit_code = status.code().unwrap_or(-1);
                    let final_status = if kill_requested {
                        AppStatus::Killed
                    } else if exit_code == 0 {
                        AppStatus::Done
                    } else {
                        AppStatus::Failed
                    };
                    tracing::info!(
                        "Executable of application {} from user {} completed (exit code {})",
                        app_id,
                        child.user,
                        exit_code
                    );
                    let path = child.path.display().to_string();
                    self.finish_app(app_id, &path, final_status, Some(exit_code));
                }
                None => index += 1,
            }
        }
    }

    fn finish_app(&self, app_id: u64, path: &str, status: AppStatus, exit_code: Option<i32>) {
        if let Err(err) = self.master.update_application(
            app_id,
            AppUpdate {
                status: Some(status),
                exit_code,
                ..Default::default()
            },
        ) {
            tracing::error!("Could not update application {}: {}", app_id, err);
        }
        self.events.publish(AppEvent {
            app_id,
            status,
            exit_code,
            path: path.to_owned(),
        });
    }

    /// Terminates every remaining child, waits out the grace period, marks
    /// survivors (and all other unreaped children) killed.
    async fn terminate_children(&mut self) {
        for child in &mut self.children {
            tracing::warn!(
                "Terminating application {} requested by {} (PID {:?})",
                child.app_id,
                child.user,
                child.child.id()
            );
            let _ = child.child.start_kill();
        }

        let grace = self.config.shutdown_grace;
        for mut child in std::mem::take(&mut self.children) {
            if timeout(grace, child.child.wait()).await.is_err() {
                tracing::warn!(
                    "Child process of application {} did not return after {:?}.",
                    child.app_id,
                    grace
                );
            }
            child.abort_reader();
            let path = child.path.display().to_string();
            self.finish_app(child.app_id, &path, AppStatus::Killed, None);
        }
    }
}
