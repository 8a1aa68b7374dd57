//! `homesight-hal` – the outside world, as the pipeline sees it.
//!
//! The pipeline never talks to a camera or a light bulb directly. It talks
//! to the collaborator traits defined here; concrete HTTP implementations
//! live in `homesight-runtime`, in-process simulations live in [`sim`].
//!
//! # Modules
//!
//! - [`camera`] – [`CameraSource`] / [`CameraStream`]: decoded frames plus
//!   connect/disconnect events for one stream source.
//! - [`device`] – [`DeviceController`]: submits device commands and reports
//!   their eventual outcome.
//! - [`catalog`] – [`DeviceCatalog`]: the devices and scenes the planner may
//!   target.
//! - [`sim`] – simulated collaborators for tests and headless runs.

pub mod camera;
pub mod catalog;
pub mod device;
pub mod sim;

pub use camera::{CameraFrame, CameraSource, CameraStream, StreamEvent};
pub use catalog::{DeviceCatalog, DeviceInfo, SceneInfo};
pub use device::{DeviceAck, DeviceController};
