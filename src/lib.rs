//! # sendside
//!
//! Send-side congestion control and paced transmission for a real-time media
//! sender.
//!
//! The core watches per-packet transport feedback coming back from the
//! receiver, estimates how much the network can carry, decides a target send
//! rate and meters outgoing packets so the chosen rate is actually respected
//! on the wire.
//!
//! ## Architecture
//!
//! - **Estimation**: delay-gradient trendline over arrival-time groups, a
//!   loss-rate ceiling, and probe clusters that measure above the estimate.
//! - **Pacing**: token-bucket budget over per-kind priority queues
//!   (audio > retransmission > video > padding), padding synthesis, probe
//!   emission and congestion-window gating.
//! - **Determinism**: a virtual clock and serial task queues drive the whole
//!   core in simulated time; the bundled network simulator exercises it
//!   under controlled capacity, delay, jitter and loss.

pub mod alr;
pub mod config;
pub mod controller;
pub mod cwnd;
pub mod error;
pub mod estimator;
pub mod feedback;
pub mod pacer;
pub mod probe;
pub mod protocol;
pub mod scheduler;
pub mod sim;
pub mod time;
pub mod units;

pub use config::{CongestionConfig, Experiments};
pub use controller::{PacketSink, SendSideController, TargetTransferRateObserver};
pub use error::SendSideError;
pub use estimator::{BandwidthEstimator, BandwidthUsage, NetworkEstimate, TargetTransferRate};
pub use feedback::{FeedbackBatch, PacketOutcome, TransportFeedbackAdapter};
pub use pacer::{EgressPacket, PacedPacketInfo, Pacer, PacketKind};
pub use probe::{ProbeClusterConfig, ProbeController};
pub use protocol::TransportFeedback;
pub use scheduler::{RepeatDecision, Scheduler, TaskHandle, TaskQueue};
pub use time::{Clock, RealTimeClock, SimulatedClock, TimeController};
pub use units::{DataRate, DataSize, TimeDelta, Timestamp};
