//! # pourlink-validators
//!
//! Domain validation for the pouring cell: every measurement and command
//! that crosses the bridge passes through exactly one of the validators in
//! this crate before it can reach a dashboard or the robot.
//!
//! The validators are plain synchronous state machines. They own their own
//! history windows and never touch the network, which keeps them trivially
//! testable and lets the async pipeline drive them from a single task
//! without locking.
//!
//! - [`weight::WeightValidator`] – scale readings, clamping and stability
//!   scoring over a rolling window per filter variant.
//! - [`concentration::ConcentrationValidator`] – target setpoints, rounding
//!   and change classification.
//! - [`robot_event::RobotEventValidator`] – scenario step progression from
//!   numeric event codes.
//! - [`command::CommandValidator`] – bounds checks for control commands,
//!   clamping with warnings rather than rejecting.

pub mod command;
pub mod concentration;
pub mod payload;
pub mod robot_event;
pub mod weight;

pub use command::{CommandValidator, JointLimit, RobotLimits, COMMAND_HISTORY_CAP};
pub use concentration::{ConcentrationLimits, ConcentrationValidator};
pub use payload::ScalarPayload;
pub use robot_event::{event_info, RobotEventValidator};
pub use weight::{WeightLimits, WeightValidator};
