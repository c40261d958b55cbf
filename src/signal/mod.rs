//! Inbound UI signals: scroll kinematics and render-loop health.
//!
//! - [`scroll`]: velocity tracking and Idle/Slow/Fast regime classification
//! - [`backpressure`]: frame-drop monitoring and degrade signals

pub mod backpressure;
pub mod scroll;
