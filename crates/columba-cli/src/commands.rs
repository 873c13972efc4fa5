//! Command handlers for the Columba CLI

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use columba_core::{ColumbaResult, DestinationId, ProcessStatus};
use columba_harness::{
    fixtures, CountingResourceProvider, InMemoryRelayStore, MockEngineFactory, MockEngineScript,
};
use columba_runtime::{AppEvent, CompletionCallback, MeshService, ServiceBuilder};
use tokio::{
    sync::oneshot,
    time::{interval, sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::CliAppConfig;
use crate::error::{CliError, Result};

/// A service wired to the simulated engine and store
struct Session {
    service: MeshService,
    factory: Arc<MockEngineFactory>,
    store: Arc<InMemoryRelayStore>,
    config: CliAppConfig,
}

impl Session {
    fn new(config: CliAppConfig) -> Result<Self> {
        let script = MockEngineScript::slow_start(Duration::from_millis(
            config.simulation.engine_start_delay_ms,
        ));
        let factory = Arc::new(MockEngineFactory::with_script(script));
        let store = Arc::new(InMemoryRelayStore::new());
        let service = ServiceBuilder::new(factory.clone(), store.clone())
            .with_resources(Arc::new(CountingResourceProvider::new()))
            .with_poll_config(config.service.poll.clone())
            .with_relay_config(config.service.relay.clone())
            .build()?;
        Ok(Self {
            service,
            factory,
            store,
            config,
        })
    }

    /// Initialize and wait for the completion callback
    async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel::<ColumbaResult<()>>();
        let callback: CompletionCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.service
            .initialize(self.config.service.clone(), callback);

        let limit = self.config.service.lifecycle.startup_timeout() + Duration::from_secs(1);
        match timeout(limit, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(CliError::NotReady("initialization was superseded".to_string())),
            Err(_) => Err(CliError::NotReady(self.service.status_tag())),
        }
    }

    /// Shut down and wait for teardown to settle
    async fn stop(&self) {
        self.service.shutdown();
        let mut status = self.service.subscribe_status();
        let limit = self.config.service.lifecycle.teardown_timeout() + Duration::from_secs(1);
        if timeout(limit, status.wait_for(|s| *s == ProcessStatus::Shutdown))
            .await
            .is_err()
        {
            warn!("Service still {} after shutdown", self.service.status_tag());
        }
    }
}

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliAppConfig) -> Result<()> {
        match cli.command {
            Commands::Simulate { duration, json } => {
                Self::handle_simulate_command(config, Duration::from_secs(duration), json).await
            }
            Commands::Cycle { cycles } => Self::handle_cycle_command(config, cycles).await,
            Commands::Relay { destination, name } => {
                Self::handle_relay_command(config, &destination, name).await
            }
            Commands::Config => Self::handle_config_command(&config),
        }
    }

    /// Drive a session with announcing, churning relays
    async fn handle_simulate_command(
        config: CliAppConfig,
        duration: Duration,
        json: bool,
    ) -> Result<()> {
        let session = Session::new(config)?;
        let mut events = session.service.subscribe_events();
        let printer = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Could not encode event: {}", e),
                    }
                } else {
                    print_event(&event);
                }
            }
        });

        session.start().await?;
        let engine = session
            .factory
            .latest()
            .ok_or_else(|| CliError::NotReady("no engine was started".to_string()))?;
        session.service.set_conversation_active(true);

        let simulation = session.config.simulation.clone();
        let mut ticker = interval(Duration::from_millis(simulation.announce_interval_ms));
        let deadline = sleep(duration);
        tokio::pin!(deadline);
        let mut round: u32 = 0;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = ticker.tick() => {
                    let shift = round / simulation.churn_every_rounds.max(1);
                    for n in 1..=simulation.relays {
                        let hops = ((u32::from(n) + shift) % u32::from(simulation.relays)) as u8 + 1;
                        engine.queue_announce(fixtures::propagation_announce(n, hops));
                    }
                    debug!("Announce round {} queued", round);
                    round += 1;
                }
            }
        }

        let relay = session.service.relay();
        println!();
        println!("Simulation Summary");
        println!("==================");
        println!("Status: {}", session.service.status_tag());
        println!("Generation: {}", session.service.generation());
        println!("Announce rounds: {}", round);
        println!("Poll cycles: {}", session.service.poller().cycles());
        println!("Relay state: {}", relay.state());
        println!("Automatic selections: {}", relay.applied_count());
        match relay.current_relay() {
            Some(current) => println!("Current relay: {}", current),
            None => println!("Current relay: none"),
        }
        println!("Known candidates: {}", session.store.candidates().len());

        session.stop().await;
        printer.abort();
        Ok(())
    }

    /// Fire overlapping initialize/shutdown pairs, then check the final state
    async fn handle_cycle_command(config: CliAppConfig, cycles: u32) -> Result<()> {
        let session = Session::new(config)?;
        let completions = Arc::new(AtomicUsize::new(0));

        for cycle in 0..cycles {
            let counter = completions.clone();
            let callback: CompletionCallback = Box::new(move |result| {
                debug!("Cycle completion: {:?}", result.is_ok());
                counter.fetch_add(1, Ordering::SeqCst);
            });
            session
                .service
                .initialize(session.config.service.clone(), callback);
            if cycle % 2 == 1 {
                sleep(Duration::from_millis(10)).await;
            }
            session.service.shutdown();
        }

        session.start().await?;
        info!("Settled after {} cycles", cycles);

        println!("Cycle Summary");
        println!("=============");
        println!("Status: {}", session.service.status_tag());
        println!("Generation: {}", session.service.generation());
        println!("Engines started: {}", session.factory.engines().len());
        println!(
            "Interrupted attempts that reported back: {}",
            completions.load(Ordering::SeqCst)
        );
        let stray: usize = session
            .factory
            .engines()
            .iter()
            .map(|engine| engine.calls_after_shutdown())
            .sum();
        println!("Calls into stopped engines: {}", stray);

        session.stop().await;
        Ok(())
    }

    /// Pin a relay by hand
    async fn handle_relay_command(
        config: CliAppConfig,
        destination: &str,
        name: String,
    ) -> Result<()> {
        let destination: DestinationId = destination.parse()?;
        let session = Session::new(config)?;
        session.start().await?;

        session.service.set_manual_relay(destination, name).await?;
        let relay = session.service.relay();
        println!("Relay state: {}", relay.state());
        println!("Auto-select: {}", relay.auto_select());
        match session.store.current_selection() {
            Some(selected) => println!(
                "Selected: {} ({}, manual: {})",
                selected.display_name, selected.destination_id, selected.manual
            ),
            None => println!("Selected: none"),
        }

        session.stop().await;
        Ok(())
    }

    fn handle_config_command(config: &CliAppConfig) -> Result<()> {
        print!("{}", config.to_toml()?);
        Ok(())
    }
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::StatusChanged { status } => println!("[status] {}", status),
        AppEvent::AnnounceReceived { announce } => {
            println!("[announce] {} ({} hops)", announce.destination_id, announce.hops)
        }
        AppEvent::MessageReceived { message } => {
            println!("[message] {}: {}", message.source, message.content)
        }
        AppEvent::DeliveryStatus { update } => {
            println!("[delivery] {} {:?}", update.message_id, update.state)
        }
        AppEvent::RelaySelected { relay } => println!(
            "[relay] {} ({}){}",
            relay.display_name,
            relay.destination_id,
            if relay.manual { " manual" } else { "" }
        ),
        AppEvent::RelayLoopDetected {
            selections_in_window,
            backoff_ms,
        } => println!(
            "[relay] loop detected: {} selections, backing off {}ms",
            selections_in_window, backoff_ms
        ),
    }
}
