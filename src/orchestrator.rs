//! Resolves device→TSDB-profile bindings, starts one device loop per
//! configured device, joins on shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use crate::config::Config;
use crate::device::Device;
use crate::metric::MetricConfig;
use crate::status::{DeviceControl, StatusState};
use crate::tsdb::{self, TsdbHandle};

/// Starts every TSDB profile referenced by at least one device (each
/// initialized exactly once), spawns one device loop per device, and joins
/// them. Blocks on `quit` once all devices have been spawned; when
/// `http_port` is nonzero also starts the status server.
pub async fn run(config: Arc<Config>, http_port: u16) -> Result<()> {
    let metric_cfgs: Arc<HashMap<String, Arc<MetricConfig>>> = Arc::new(
        config
            .metrics
            .iter()
            .map(|(id, cfg)| (id.clone(), Arc::new(cfg.clone())))
            .collect(),
    );

    let mut tsdb_profiles: HashMap<String, TsdbHandle> = HashMap::new();
    for device in config.snmp_devices.values() {
        let profile_name = config.resolve_tsdb(device)?.id.clone();
        if let std::collections::hash_map::Entry::Vacant(entry) = tsdb_profiles.entry(profile_name.clone()) {
            let tsdb_cfg = Arc::new(config.influx.get(&profile_name).unwrap().clone());
            let handle = tsdb::connect(tsdb_cfg)
                .await
                .with_context(|| format!("connecting tsdb profile {profile_name}"))?;
            entry.insert(handle);
        }
    }
    let tsdb_profiles = Arc::new(tsdb_profiles);

    let (quit_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut device_counters = HashMap::new();
    let mut device_controls = HashMap::new();
    let mut join_handles = Vec::new();

    for (id, device_cfg) in &config.snmp_devices {
        let profile_name = config.resolve_tsdb(device_cfg)?.id.clone();
        let tsdb_handle = tsdb_profiles.get(&profile_name).unwrap().clone();

        let device = Device::new(Arc::new(device_cfg.clone()), config.general.log_dir.clone());
        device_counters.insert(id.clone(), device.counters.clone());
        device_controls.insert(
            id.clone(),
            DeviceControl {
                debug: device.debug_sender(),
                enabled: device.enabled_query_sender(),
            },
        );

        let config = config.clone();
        let metric_cfgs = metric_cfgs.clone();
        let quit_rx = quit_tx.subscribe();
        let handle = tokio::spawn(async move { device.run(config, metric_cfgs, tsdb_handle, quit_rx).await });
        join_handles.push(handle);
    }

    info!("orchestrator: started {} device loops", join_handles.len());

    if http_port != 0 {
        let state = StatusState {
            devices: Arc::new(device_counters),
            controls: Arc::new(device_controls),
            tsdb_profiles: tsdb_profiles.clone(),
        };
        let mut quit_rx = quit_tx.subscribe();
        tokio::select! {
            result = crate::status::serve(http_port, state) => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("orchestrator: received shutdown signal");
            }
            _ = quit_rx.recv() => {}
        }
    } else {
        let mut quit_rx = quit_tx.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("orchestrator: received shutdown signal");
            }
            _ = quit_rx.recv() => {}
        }
    }
    let _ = quit_tx.send(());

    for handle in join_handles {
        handle.await??;
    }
    Ok(())
}
