//! Builds instruments from [`Settings`] and runs the configured sweep.

use crate::adapters::{ScpiTransport, VisaAdapter};
use crate::config::{BiasSourceConfig, Settings, TimeoutConfig};
use crate::error::{AppResult, SweepError};
use crate::instrument::{
    BiasSource, DependentInstrument, DwellMeasurement, EventLog, MockAnalyzer, MockBiasSource,
    ScpiNetworkAnalyzer, ScpiSmu,
};
use crate::sweep::{run_repeated, SweepOrchestrator, SweepReport};
use std::time::Duration;
use tracing::{error, info, warn};

async fn open_transport(resource: &str, timeouts: &TimeoutConfig) -> AppResult<Box<dyn ScpiTransport>> {
    let adapter = VisaAdapter::new(resource)
        .with_timeout(Duration::from_millis(timeouts.default_ms))
        .open()
        .await?;
    Ok(Box::new(adapter))
}

/// Connects and configures every instrument in `settings`.
///
/// Bias sources are configured for compliance and protection and left at
/// 0 V. With `dry_run` every instrument is simulated and nothing is opened.
pub async fn build_orchestrator(settings: &Settings, dry_run: bool) -> AppResult<SweepOrchestrator> {
    let log = EventLog::new();
    let timeouts = &settings.timeouts;

    let dependent: Box<dyn DependentInstrument> = match (&settings.analyzer, dry_run) {
        (Some(analyzer), true) => Box::new(MockAnalyzer::new(log.clone()).with_ports(analyzer.ports.len())),
        (Some(analyzer), false) => {
            let transport = open_transport(&analyzer.resource, timeouts).await?;
            Box::new(
                ScpiNetworkAnalyzer::new(
                    analyzer.resource.clone(),
                    transport,
                    analyzer.ports.clone(),
                    analyzer.balanced,
                    settings.storage.remote_dir.clone(),
                )
                .with_sweep_timeout(Duration::from_millis(timeouts.sweep_ms)),
            )
        }
        (None, _) => Box::new(DwellMeasurement::new(settings.dwell())),
    };
    info!(instrument = %dependent.name(), dry_run, "Dependent instrument ready");

    let mut orchestrator = SweepOrchestrator::new(settings.sweep_plan(), dependent);
    for source in &settings.bias_sources {
        let voltages = source.voltages.values();
        if dry_run {
            orchestrator = orchestrator.with_source(
                Box::new(MockBiasSource::new(source.label.clone(), log.clone())),
                voltages,
            );
            continue;
        }

        match connect_smu(source, timeouts).await {
            Ok(smu) => orchestrator = orchestrator.with_source(Box::new(smu), voltages),
            Err(err) => return Err(abandon(&mut orchestrator, err).await),
        }
    }
    Ok(orchestrator)
}

async fn connect_smu(source: &BiasSourceConfig, timeouts: &TimeoutConfig) -> AppResult<ScpiSmu> {
    let transport = open_transport(&source.resource, timeouts).await?;
    let mut smu = ScpiSmu::new(source.label.clone(), transport)
        .with_fetch_timeout(Duration::from_millis(timeouts.fetch_ms));
    if let Err(err) = smu
        .configure(source.protection_voltage(), source.compliance_amps)
        .await
    {
        if let Err(close_err) = smu.disconnect().await {
            warn!(source = %source.label, "Failed to disconnect after configure error: {}", close_err);
        }
        return Err(err);
    }
    Ok(smu)
}

/// Disconnects everything already attached to `orchestrator`, then hands back
/// `err` so the caller can return it.
async fn abandon(orchestrator: &mut SweepOrchestrator, err: SweepError) -> SweepError {
    error!("Instrument setup failed: {}", err);
    if let Err(shutdown_err) = orchestrator.shutdown().await {
        error!("Disconnecting connected instruments also failed: {}", shutdown_err);
    }
    err
}

/// Runs the sweep once, or repeatedly when `[sweep.repeat]` is set, then
/// disconnects every instrument whether or not the sweep succeeded.
pub async fn run_configured(
    orchestrator: &mut SweepOrchestrator,
    settings: &Settings,
) -> AppResult<Vec<SweepReport>> {
    let result = match settings.repeat() {
        Some((interval, count)) => run_repeated(orchestrator, interval, count).await,
        None => orchestrator.run().await.map(|report| vec![report]),
    };
    let shutdown = orchestrator.shutdown().await;

    match (result, shutdown) {
        (Ok(reports), Ok(())) => Ok(reports),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Err(shutdown_err)) => {
            error!("Shutdown after failed sweep also failed: {}", shutdown_err);
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
    }
}
