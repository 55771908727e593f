//! Node configuration, mapped onto the component configs at construction.

use std::time::Duration;

use loramesh_routing::engine::RoutingConfig;
use loramesh_routing::table::TableConfig;
use loramesh_transport::cache::FragmentCacheConfig;
use loramesh_transport::dutycycle::regions::{self, RegionPreset};
use loramesh_transport::dutycycle::DutyCycleConfig;
use loramesh_transport::queue::QueueConfig;
use loramesh_transport::reassembly::ReassemblyConfig;
use loramesh_transport::reliable::{BreakerConfig, DeliveryConfig, RetryPolicy};

use crate::error::MeshError;

/// Top-level mesh configuration. `validate` is the single synchronous
/// failure path of node construction.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Regional preset code (EU, US, ...).
    pub region: String,
    /// Overrides every sub-band duty-cycle limit (percent).
    pub max_duty_cycle_percent: Option<f64>,
    pub tracking_window_hours: f64,
    pub max_transmission_time_ms: u64,
    pub emergency_override_enabled: bool,
    pub strict_compliance_mode: bool,
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,

    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub ack_timeout_ms: u64,
    pub breaker: BreakerConfig,
    pub dead_letter_capacity: usize,

    pub reassembly: ReassemblyConfig,
    pub fragment_cache: FragmentCacheConfig,

    pub route_discovery_timeout_ms: u64,
    pub max_flood_ttl: u8,
    pub max_path_length: usize,
    pub flood_cache_size: usize,
    pub route_expiry_ms: u64,
    pub hold_down_ms: u64,
    pub max_routing_table_size: usize,
    pub hello_interval_ms: u64,

    /// Fee thresholds (satoshi per byte) for transaction priority.
    pub high_fee_sat_per_byte: f64,
    pub normal_fee_sat_per_byte: f64,
    /// Default TTL for queued messages.
    pub message_ttl: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            region: "EU".to_owned(),
            max_duty_cycle_percent: None,
            tracking_window_hours: 1.0,
            max_transmission_time_ms: 4_000,
            emergency_override_enabled: false,
            strict_compliance_mode: false,
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            ack_timeout_ms: 5_000,
            breaker: BreakerConfig::default(),
            dead_letter_capacity: 32,
            reassembly: ReassemblyConfig::default(),
            fragment_cache: FragmentCacheConfig::default(),
            route_discovery_timeout_ms: 15_000,
            max_flood_ttl: 10,
            max_path_length: 15,
            flood_cache_size: 500,
            route_expiry_ms: 300_000,
            hold_down_ms: 60_000,
            max_routing_table_size: 256,
            hello_interval_ms: 30_000,
            high_fee_sat_per_byte: 10.0,
            normal_fee_sat_per_byte: 1.0,
            message_ttl: Duration::from_secs(600),
        }
    }
}

impl MeshConfig {
    pub fn region_preset(&self) -> Result<&'static RegionPreset, MeshError> {
        regions::region(&self.region)
            .ok_or_else(|| MeshError::ConfigInvalid(format!("unknown region {:?}", self.region)))
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        self.region_preset()?;
        if self.tracking_window_hours <= 0.0 {
            return Err(MeshError::ConfigInvalid(
                "tracking window must be positive".into(),
            ));
        }
        if self.high_fee_sat_per_byte < self.normal_fee_sat_per_byte {
            return Err(MeshError::ConfigInvalid(
                "high fee threshold below normal threshold".into(),
            ));
        }
        if self.max_flood_ttl == 0 || self.max_path_length == 0 {
            return Err(MeshError::ConfigInvalid(
                "flood TTL and path length must be non-zero".into(),
            ));
        }
        self.duty_cycle_config()?.validate().map_err(MeshError::from)?;
        self.retry.validate().map_err(MeshError::from)?;
        Ok(())
    }

    pub fn duty_cycle_config(&self) -> Result<DutyCycleConfig, MeshError> {
        Ok(DutyCycleConfig {
            region: self.region_preset()?,
            tracking_window: Duration::from_secs_f64(self.tracking_window_hours * 3600.0),
            max_duty_cycle_override: self.max_duty_cycle_percent,
            max_transmission_time: Duration::from_millis(self.max_transmission_time_ms),
            warn_threshold: 0.8,
            emergency_override_enabled: self.emergency_override_enabled,
            strict_compliance: self.strict_compliance_mode,
            spreading_factor: self.spreading_factor,
            bandwidth_hz: self.bandwidth_hz,
        })
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            policy: self.retry.clone(),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            breaker: self.breaker.clone(),
            dead_letter_capacity: self.dead_letter_capacity,
        }
    }

    pub fn routing_config(&self) -> RoutingConfig {
        RoutingConfig {
            max_flood_ttl: self.max_flood_ttl,
            max_path_length: self.max_path_length,
            flood_cache_size: self.flood_cache_size,
            flood_cache_window: Duration::from_millis(self.route_expiry_ms),
            route_discovery_timeout: Duration::from_millis(self.route_discovery_timeout_ms),
            hello_interval: Duration::from_millis(self.hello_interval_ms),
            table: TableConfig {
                max_entries: self.max_routing_table_size,
                route_expiry: Duration::from_millis(self.route_expiry_ms),
                hold_down: Duration::from_millis(self.hold_down_ms),
            },
        }
    }
}
