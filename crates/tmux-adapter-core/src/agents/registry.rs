//! Agent registry.
//!
//! Keeps the live agent set current by rescanning the multiplexer's sessions
//! whenever a session notification arrives (with a coalescing interval tick
//! as a safety net) and emits added/removed/updated diff events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use super::detector::{detect_agent, DetectorConfig, ProcessInspector, SessionEnv};
use super::Agent;
use crate::control::{MuxCommands, Notification};
use crate::error::Result;

/// Coalesced rescan tick; notifications trigger scans sooner.
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Lifecycle events emitted on every scan diff.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(Agent),
    Removed(Agent),
    /// A tracked field changed; today that is `attached`.
    Updated(Agent),
}

/// Watches multiplexer sessions and materialises the live agent set.
pub struct Registry {
    mux: Arc<dyn MuxCommands>,
    config: DetectorConfig,
    inspector: Arc<dyn ProcessInspector>,
    known: Arc<RwLock<HashMap<String, Agent>>>,
    event_tx: broadcast::Sender<RegistryEvent>,
    stop_tx: watch::Sender<bool>,
}

impl Registry {
    pub fn new(
        mux: Arc<dyn MuxCommands>,
        config: DetectorConfig,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (stop_tx, _) = watch::channel(false);
        Self {
            mux,
            config,
            inspector,
            known: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            stop_tx,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Prime the known set with one synchronous scan, then watch for session
    /// notifications and rescan on any trigger.
    pub async fn start(&self, mut notifications: broadcast::Receiver<Notification>) -> Result<()> {
        Self::scan(
            &self.mux,
            &self.config,
            self.inspector.as_ref(),
            &self.known,
            &self.event_tx,
        )
        .await;
        info!(
            agents = self.known.read().await.len(),
            "agent registry primed"
        );

        let mux = Arc::clone(&self.mux);
        let config = self.config.clone();
        let inspector = Arc::clone(&self.inspector);
        let known = Arc::clone(&self.known);
        let event_tx = self.event_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RESCAN_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut notifications_open = true;

            loop {
                let triggered = tokio::select! {
                    note = notifications.recv(), if notifications_open => match note {
                        Ok(Notification::SessionsChanged)
                        | Ok(Notification::SessionChanged { .. }) => true,
                        // Lagging just coalesces triggers; rescan to be safe.
                        Err(broadcast::error::RecvError::Lagged(_)) => true,
                        Err(broadcast::error::RecvError::Closed) => {
                            // Control connection is gone; the tick alone drives
                            // scans until the daemon exits.
                            notifications_open = false;
                            false
                        }
                        Ok(_) => continue,
                    },
                    _ = tick.tick() => true,
                    _ = stop_rx.changed() => break,
                };

                if triggered {
                    Self::scan(&mux, &config, inspector.as_ref(), &known, &event_tx).await;
                }
            }
            debug!("agent registry scan task stopped");
        });

        Ok(())
    }

    /// Stop the scan task. Snapshot queries keep working on the last set.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Copy of all agents, sorted by name.
    pub async fn get_agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.known.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Copy of one agent.
    pub async fn get_agent(&self, name: &str) -> Option<Agent> {
        self.known.read().await.get(name).cloned()
    }

    async fn scan(
        mux: &Arc<dyn MuxCommands>,
        config: &DetectorConfig,
        inspector: &dyn ProcessInspector,
        known: &Arc<RwLock<HashMap<String, Agent>>>,
        event_tx: &broadcast::Sender<RegistryEvent>,
    ) {
        let sessions = match mux.list_sessions().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "scan: list-sessions failed");
                return;
            }
        };

        let mut next = HashMap::new();
        for session in sessions {
            // Cheap gate before three environment round trips per session.
            if !session.name.starts_with("hq-") && !session.name.starts_with("gt-") {
                continue;
            }

            let env = SessionEnv {
                agent: mux
                    .show_environment(&session.name, "GT_AGENT")
                    .await
                    .unwrap_or(None),
                role: mux
                    .show_environment(&session.name, "GT_ROLE")
                    .await
                    .unwrap_or(None),
                rig: mux
                    .show_environment(&session.name, "GT_RIG")
                    .await
                    .unwrap_or(None),
            };

            let pane = match mux.pane_info(&session.name).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(session = %session.name, error = %e, "scan: pane info failed");
                    continue;
                }
            };

            match detect_agent(config, &session.name, session.attached, &pane, &env, inspector) {
                Ok(agent) => {
                    next.insert(agent.name.clone(), agent);
                }
                Err(reason) => {
                    debug!(session = %session.name, ?reason, "scan: not an agent");
                }
            }
        }

        // Atomically replace the known set; emit the diff after the lock is
        // released so snapshot readers never wait on event delivery.
        let (removed, added, updated) = {
            let mut guard = known.write().await;
            let diff = diff_agents(&guard, &next);
            *guard = next;
            diff
        };

        for agent in removed {
            info!(agent = %agent.name, "agent removed");
            let _ = event_tx.send(RegistryEvent::Removed(agent));
        }
        for agent in added {
            info!(agent = %agent.name, role = ?agent.role, runtime = ?agent.runtime, "agent added");
            let _ = event_tx.send(RegistryEvent::Added(agent));
        }
        for agent in updated {
            debug!(agent = %agent.name, attached = agent.attached, "agent updated");
            let _ = event_tx.send(RegistryEvent::Updated(agent));
        }
    }
}

/// Set-difference of two scans: removed = old∖new, added = new∖old,
/// updated = intersection where `attached` differs. Each list sorted by name.
pub fn diff_agents(
    old: &HashMap<String, Agent>,
    new: &HashMap<String, Agent>,
) -> (Vec<Agent>, Vec<Agent>, Vec<Agent>) {
    let mut removed: Vec<Agent> = old
        .values()
        .filter(|a| !new.contains_key(&a.name))
        .cloned()
        .collect();
    let mut added: Vec<Agent> = new
        .values()
        .filter(|a| !old.contains_key(&a.name))
        .cloned()
        .collect();
    let mut updated: Vec<Agent> = new
        .values()
        .filter(|a| {
            old.get(&a.name)
                .is_some_and(|prev| prev.attached != a.attached)
        })
        .cloned()
        .collect();

    removed.sort_by(|a, b| a.name.cmp(&b.name));
    added.sort_by(|a, b| a.name.cmp(&b.name));
    updated.sort_by(|a, b| a.name.cmp(&b.name));
    (removed, added, updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{PaneInfo, Role, Runtime};
    use crate::test_support::MockMux;
    use std::path::PathBuf;

    struct AlwaysAlive;

    impl ProcessInspector for AlwaysAlive {
        fn pid_alive(&self, _pid: i32) -> bool {
            true
        }
        fn children(&self, _pid: i32) -> Vec<crate::agents::Process> {
            Vec::new()
        }
    }

    fn agent(name: &str, attached: bool) -> Agent {
        Agent {
            name: name.to_string(),
            role: Role::Crew,
            runtime: Runtime::Claude,
            rig: Some("foo".to_string()),
            work_dir: PathBuf::from("/home/u/gt"),
            attached,
        }
    }

    fn map(agents: &[Agent]) -> HashMap<String, Agent> {
        agents.iter().map(|a| (a.name.clone(), a.clone())).collect()
    }

    #[test]
    fn diff_added_removed_updated() {
        let old = map(&[agent("a", false), agent("b", false), agent("c", true)]);
        let new = map(&[agent("b", true), agent("c", true), agent("d", false)]);

        let (removed, added, updated) = diff_agents(&old, &new);

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "a");
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].name, "d");
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].name, "b");
        assert!(updated[0].attached);
    }

    #[test]
    fn diff_empty_sets() {
        let (removed, added, updated) = diff_agents(&HashMap::new(), &HashMap::new());
        assert!(removed.is_empty() && added.is_empty() && updated.is_empty());
    }

    fn registry_fixture() -> (Arc<MockMux>, Registry) {
        let mux = Arc::new(MockMux::new());
        let registry = Registry::new(
            mux.clone(),
            DetectorConfig {
                gt_dir: PathBuf::from("/home/u/gt"),
            },
            Arc::new(AlwaysAlive),
        );
        (mux, registry)
    }

    fn seed_session(mux: &MockMux, name: &str, attached: bool, command: &str) {
        mux.add_session(name, attached);
        mux.set_pane(
            name,
            PaneInfo {
                pane_id: "%1".to_string(),
                command: command.to_string(),
                pid: 42,
                work_dir: PathBuf::from("/home/u/gt/rigs/foo"),
            },
        );
    }

    #[tokio::test]
    async fn scan_materialises_agents_and_ignores_foreign_sessions() {
        let (mux, registry) = registry_fixture();
        seed_session(&mux, "hq-mayor", true, "claude");
        mux.add_session("random-shell", false);

        Registry::scan(
            &registry.mux,
            &registry.config,
            registry.inspector.as_ref(),
            &registry.known,
            &registry.event_tx,
        )
        .await;

        let agents = registry.get_agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "hq-mayor");
        assert_eq!(agents[0].role, Role::Mayor);
        assert!(agents[0].attached);

        // No environment probes for the unrecognised session.
        assert!(!mux
            .trace()
            .iter()
            .any(|line| line.contains("random-shell")));
    }

    #[tokio::test]
    async fn scan_emits_diff_events_in_order() {
        let (mux, registry) = registry_fixture();
        seed_session(&mux, "hq-mayor", false, "claude");
        seed_session(&mux, "gt-foo-crew-bar", false, "gemini");
        mux.set_env("gt-foo-crew-bar", "GT_RIG", "foo");

        let mut events = registry.subscribe();
        Registry::scan(
            &registry.mux,
            &registry.config,
            registry.inspector.as_ref(),
            &registry.known,
            &registry.event_tx,
        )
        .await;

        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Added(a) if a.name == "gt-foo-crew-bar"));
        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Added(a) if a.name == "hq-mayor"));

        // Second scan: one session vanishes, one flips attached.
        mux.remove_session("gt-foo-crew-bar");
        mux.set_attached("hq-mayor", true);

        Registry::scan(
            &registry.mux,
            &registry.config,
            registry.inspector.as_ref(),
            &registry.known,
            &registry.event_tx,
        )
        .await;

        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Removed(a) if a.name == "gt-foo-crew-bar"));
        assert!(matches!(events.try_recv().unwrap(), RegistryEvent::Updated(a) if a.name == "hq-mayor" && a.attached));
    }

    #[tokio::test]
    async fn snapshots_are_sorted_copies() {
        let (mux, registry) = registry_fixture();
        seed_session(&mux, "hq-mayor", false, "claude");
        seed_session(&mux, "gt-foo-crew-bar", false, "claude");
        mux.set_env("gt-foo-crew-bar", "GT_RIG", "foo");

        Registry::scan(
            &registry.mux,
            &registry.config,
            registry.inspector.as_ref(),
            &registry.known,
            &registry.event_tx,
        )
        .await;

        let agents = registry.get_agents().await;
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].name, "gt-foo-crew-bar");
        assert_eq!(agents[1].name, "hq-mayor");

        assert!(registry.get_agent("hq-mayor").await.is_some());
        assert!(registry.get_agent("nope").await.is_none());
    }

    #[tokio::test]
    async fn start_scans_on_notification() {
        let (mux, registry) = registry_fixture();
        let (notif_tx, notif_rx) = broadcast::channel(8);

        let mut events = registry.subscribe();
        registry.start(notif_rx).await.unwrap();

        seed_session(&mux, "hq-deacon", false, "claude");
        notif_tx.send(Notification::SessionsChanged).unwrap();

        // Either the notification or the safety tick triggers the scan; the
        // diff makes the Added event fire exactly once.
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event before timeout")
            .unwrap();
        assert!(matches!(event, RegistryEvent::Added(a) if a.name == "hq-deacon"));

        registry.stop();
    }
}
