//! Starlink dish gRPC client
//!
//! The dish exposes a single `Handle` endpoint taking a oneof request. All
//! calls share one HTTP/2 channel; no per-tick subprocesses. Message types
//! are hand-written prost structs covering the fields the collector
//! extracts, and the wire surface is hidden behind [`DishRpc`] so tests can
//! run against a mock dish.

use async_trait::async_trait;
use std::time::Duration;
use tonic::Request as TonicRequest;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::member::DishAlerts;

use super::CollectorError;

/// gRPC path of the dish's single endpoint.
const DISH_HANDLE_PATH: &str = "/SpaceX.API.Device.Device/Handle";

/// Wire messages for the dish RPC.
pub mod pb {
    #![allow(missing_docs)]

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Request {
        #[prost(oneof = "request::Request", tags = "1004, 1007, 1008, 1012, 1017")]
        pub request: ::core::option::Option<request::Request>,
    }

    pub mod request {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Request {
            #[prost(message, tag = "1004")]
            GetStatus(super::GetStatusRequest),
            #[prost(message, tag = "1007")]
            GetHistory(super::GetHistoryRequest),
            #[prost(message, tag = "1008")]
            GetDeviceInfo(super::GetDeviceInfoRequest),
            #[prost(message, tag = "1012")]
            GetDiagnostics(super::GetDiagnosticsRequest),
            #[prost(message, tag = "1017")]
            GetLocation(super::GetLocationRequest),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetStatusRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetHistoryRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetDeviceInfoRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetDiagnosticsRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetLocationRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Response {
        #[prost(oneof = "response::Response", tags = "2004, 2007, 2008, 2012, 2017")]
        pub response: ::core::option::Option<response::Response>,
    }

    pub mod response {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Response {
            #[prost(message, tag = "2004")]
            DishGetStatus(super::DishGetStatusResponse),
            #[prost(message, tag = "2007")]
            DishGetHistory(super::DishGetHistoryResponse),
            #[prost(message, tag = "2008")]
            GetDeviceInfo(super::GetDeviceInfoResponse),
            #[prost(message, tag = "2012")]
            DishGetDiagnostics(super::DishGetDiagnosticsResponse),
            #[prost(message, tag = "2017")]
            GetLocation(super::GetLocationResponse),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DishGetStatusResponse {
        #[prost(message, optional, tag = "1")]
        pub device_state: ::core::option::Option<DeviceState>,
        #[prost(float, tag = "2")]
        pub pop_ping_latency_ms: f32,
        #[prost(float, tag = "3")]
        pub pop_ping_drop_rate: f32,
        #[prost(float, tag = "4")]
        pub snr: f32,
        #[prost(bool, tag = "5")]
        pub is_snr_above_noise_floor: bool,
        #[prost(bool, tag = "6")]
        pub is_snr_persistently_low: bool,
        #[prost(message, optional, tag = "7")]
        pub obstruction_stats: ::core::option::Option<ObstructionStats>,
        #[prost(message, optional, tag = "8")]
        pub alerts: ::core::option::Option<DishAlertBits>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeviceState {
        #[prost(uint64, tag = "1")]
        pub uptime_s: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ObstructionStats {
        #[prost(float, tag = "1")]
        pub fraction_obstructed: f32,
        #[prost(float, tag = "2")]
        pub time_obstructed: f32,
        #[prost(float, tag = "3")]
        pub avg_prolonged_obstruction_interval_s: f32,
        #[prost(float, tag = "4")]
        pub valid_s: f32,
        #[prost(uint32, tag = "5")]
        pub patches_valid: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DishAlertBits {
        #[prost(bool, tag = "1")]
        pub thermal_throttle: bool,
        #[prost(bool, tag = "2")]
        pub thermal_shutdown: bool,
        #[prost(bool, tag = "3")]
        pub swupdate_reboot_ready: bool,
        #[prost(bool, tag = "4")]
        pub roaming: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DishGetHistoryResponse {
        #[prost(uint64, tag = "1")]
        pub current: u64,
        #[prost(float, repeated, tag = "2")]
        pub pop_ping_latency_ms: ::prost::alloc::vec::Vec<f32>,
        #[prost(float, repeated, tag = "3")]
        pub pop_ping_drop_rate: ::prost::alloc::vec::Vec<f32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetDeviceInfoResponse {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub hardware_version: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub software_version: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DishGetDiagnosticsResponse {
        #[prost(message, optional, tag = "1")]
        pub obstruction_stats: ::core::option::Option<ObstructionStats>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetLocationResponse {
        #[prost(message, optional, tag = "1")]
        pub lla: ::core::option::Option<Lla>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Lla {
        #[prost(double, tag = "1")]
        pub lat: f64,
        #[prost(double, tag = "2")]
        pub lon: f64,
        #[prost(double, tag = "3")]
        pub alt: f64,
    }
}

/// Status fields the collector consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DishStatus {
    /// Latency to the point of presence, milliseconds.
    pub pop_ping_latency_ms: Option<f64>,
    /// Drop rate to the point of presence, 0..1.
    pub pop_ping_drop_rate: Option<f64>,
    /// Signal-to-noise ratio, dB.
    pub snr: Option<f64>,
    /// SNR clears the noise floor.
    pub snr_above_noise_floor: Option<bool>,
    /// Dish flags SNR as persistently low.
    pub snr_persistently_low: Option<bool>,
    /// Dish uptime, seconds.
    pub uptime_s: Option<u64>,
    /// Obstruction statistics, when the status carried them.
    pub obstruction: Option<DishObstruction>,
    /// Device alert bits.
    pub alerts: DishAlerts,
}

/// Obstruction statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DishObstruction {
    /// Currently obstructed sky fraction, 0..1.
    pub fraction_obstructed: f64,
    /// Historical fraction of time obstructed, 0..1.
    pub time_obstructed: f64,
    /// Average prolonged obstruction interval, seconds.
    pub avg_prolonged_obstruction_s: f64,
    /// Seconds of valid measurements.
    pub valid_s: f64,
    /// Valid obstruction-map patches.
    pub patches_valid: u32,
}

/// Recent history used to derive jitter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DishHistory {
    /// Recent pop ping latencies, newest last.
    pub pop_ping_latency_ms: Vec<f64>,
    /// Recent pop ping drop rates, newest last.
    pub pop_ping_drop_rate: Vec<f64>,
}

/// Device identity, logged once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DishDeviceInfo {
    /// Dish id.
    pub id: String,
    /// Hardware revision.
    pub hardware_version: String,
    /// Firmware version.
    pub software_version: String,
}

/// Dish location (diagnostics aid).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DishLocation {
    /// Latitude, degrees.
    pub lat: f64,
    /// Longitude, degrees.
    pub lon: f64,
    /// Altitude, meters.
    pub alt: f64,
}

/// The dish RPC capability.
#[async_trait]
pub trait DishRpc: Send + Sync + std::fmt::Debug {
    /// `get_status`: the primary per-tick call.
    async fn get_status(&self, deadline: Duration) -> Result<DishStatus, CollectorError>;

    /// `get_diagnostics`: obstruction detail.
    async fn get_diagnostics(&self, deadline: Duration)
    -> Result<DishObstruction, CollectorError>;

    /// `get_history`: recent latency/drop series.
    async fn get_history(&self, deadline: Duration) -> Result<DishHistory, CollectorError>;

    /// `get_device_info`: identity, cached by the collector.
    async fn get_device_info(&self, deadline: Duration)
    -> Result<DishDeviceInfo, CollectorError>;

    /// `get_location`: dish position.
    async fn get_location(&self, deadline: Duration) -> Result<DishLocation, CollectorError>;
}

/// gRPC-backed dish client sharing one lazily-connected HTTP/2 channel.
#[derive(Debug)]
pub struct GrpcDishClient {
    channel: Channel,
    endpoint: String,
}

impl GrpcDishClient {
    /// Creates a client for `ip:port`. The channel connects lazily on the
    /// first call.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the endpoint URI is malformed.
    pub fn connect_lazy(ip: std::net::Ipv4Addr, port: u16) -> Result<Self, CollectorError> {
        let endpoint = format!("http://{ip}:{port}");
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| CollectorError::Unavailable(format!("bad dish endpoint: {e}")))?
            .connect_timeout(Duration::from_secs(2))
            .connect_lazy();
        Ok(Self { channel, endpoint })
    }

    async fn handle(
        &self,
        request: pb::request::Request,
        deadline: Duration,
    ) -> Result<pb::Response, CollectorError> {
        let mut grpc = Grpc::new(self.channel.clone());
        let call = async {
            grpc.ready().await.map_err(|e| {
                CollectorError::Unavailable(format!("dish {} unreachable: {e}", self.endpoint))
            })?;
            let codec: ProstCodec<pb::Request, pb::Response> = ProstCodec::default();
            let path = PathAndQuery::from_static(DISH_HANDLE_PATH);
            let request = TonicRequest::new(pb::Request {
                request: Some(request),
            });
            grpc.unary(request, path, codec)
                .await
                .map(tonic::Response::into_inner)
                .map_err(|status| {
                    CollectorError::Unavailable(format!("dish rpc failed: {status}"))
                })
        };
        match tokio::time::timeout(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(CollectorError::Timeout(format!(
                "dish rpc exceeded {deadline:?}"
            ))),
        }
    }
}

fn none_if_zero(value: f32) -> Option<f64> {
    (value != 0.0).then_some(f64::from(value))
}

impl From<&pb::ObstructionStats> for DishObstruction {
    fn from(stats: &pb::ObstructionStats) -> Self {
        Self {
            fraction_obstructed: f64::from(stats.fraction_obstructed),
            time_obstructed: f64::from(stats.time_obstructed),
            avg_prolonged_obstruction_s: f64::from(stats.avg_prolonged_obstruction_interval_s),
            valid_s: f64::from(stats.valid_s),
            patches_valid: stats.patches_valid,
        }
    }
}

#[async_trait]
impl DishRpc for GrpcDishClient {
    async fn get_status(&self, deadline: Duration) -> Result<DishStatus, CollectorError> {
        let response = self
            .handle(pb::request::Request::GetStatus(pb::GetStatusRequest {}), deadline)
            .await?;
        let Some(pb::response::Response::DishGetStatus(status)) = response.response else {
            return Err(CollectorError::Parse("unexpected reply to get_status".to_string()));
        };
        let alerts = status.alerts.as_ref();
        Ok(DishStatus {
            pop_ping_latency_ms: none_if_zero(status.pop_ping_latency_ms),
            pop_ping_drop_rate: Some(f64::from(status.pop_ping_drop_rate)),
            snr: none_if_zero(status.snr),
            snr_above_noise_floor: Some(status.is_snr_above_noise_floor),
            snr_persistently_low: Some(status.is_snr_persistently_low),
            uptime_s: status.device_state.as_ref().map(|s| s.uptime_s),
            obstruction: status.obstruction_stats.as_ref().map(DishObstruction::from),
            alerts: DishAlerts {
                thermal_throttle: alerts.is_some_and(|a| a.thermal_throttle),
                thermal_shutdown: alerts.is_some_and(|a| a.thermal_shutdown),
                reboot_ready: alerts.is_some_and(|a| a.swupdate_reboot_ready),
                roaming: alerts.is_some_and(|a| a.roaming),
            },
        })
    }

    async fn get_diagnostics(
        &self,
        deadline: Duration,
    ) -> Result<DishObstruction, CollectorError> {
        let response = self
            .handle(
                pb::request::Request::GetDiagnostics(pb::GetDiagnosticsRequest {}),
                deadline,
            )
            .await?;
        let Some(pb::response::Response::DishGetDiagnostics(diag)) = response.response else {
            return Err(CollectorError::Parse(
                "unexpected reply to get_diagnostics".to_string(),
            ));
        };
        diag.obstruction_stats
            .as_ref()
            .map(DishObstruction::from)
            .ok_or_else(|| CollectorError::Parse("diagnostics without obstruction stats".to_string()))
    }

    async fn get_history(&self, deadline: Duration) -> Result<DishHistory, CollectorError> {
        let response = self
            .handle(pb::request::Request::GetHistory(pb::GetHistoryRequest {}), deadline)
            .await?;
        let Some(pb::response::Response::DishGetHistory(history)) = response.response else {
            return Err(CollectorError::Parse("unexpected reply to get_history".to_string()));
        };
        Ok(DishHistory {
            pop_ping_latency_ms: history.pop_ping_latency_ms.iter().map(|v| f64::from(*v)).collect(),
            pop_ping_drop_rate: history.pop_ping_drop_rate.iter().map(|v| f64::from(*v)).collect(),
        })
    }

    async fn get_device_info(
        &self,
        deadline: Duration,
    ) -> Result<DishDeviceInfo, CollectorError> {
        let response = self
            .handle(
                pb::request::Request::GetDeviceInfo(pb::GetDeviceInfoRequest {}),
                deadline,
            )
            .await?;
        let Some(pb::response::Response::GetDeviceInfo(info)) = response.response else {
            return Err(CollectorError::Parse(
                "unexpected reply to get_device_info".to_string(),
            ));
        };
        debug!(id = %info.id, sw = %info.software_version, "dish identified");
        Ok(DishDeviceInfo {
            id: info.id,
            hardware_version: info.hardware_version,
            software_version: info.software_version,
        })
    }

    async fn get_location(&self, deadline: Duration) -> Result<DishLocation, CollectorError> {
        let response = self
            .handle(pb::request::Request::GetLocation(pb::GetLocationRequest {}), deadline)
            .await?;
        let Some(pb::response::Response::GetLocation(location)) = response.response else {
            return Err(CollectorError::Parse("unexpected reply to get_location".to_string()));
        };
        let lla = location
            .lla
            .ok_or_else(|| CollectorError::Parse("location without lla".to_string()))?;
        Ok(DishLocation {
            lat: lla.lat,
            lon: lla.lon,
            alt: lla.alt,
        })
    }
}
