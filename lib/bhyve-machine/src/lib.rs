// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launch and supervise a bhyve VM booted from a boot2docker ISO through
//! grub-bhyve.

pub mod boot_files;
pub mod console;
pub mod driver;
pub mod instance;
pub mod launch;
pub mod termios;

pub use console::ConsoleRetry;
pub use driver::{Boot2DockerDriver, Driver, MachineParams, StoreLayout};
pub use instance::{Instance, InstanceParams, State};
pub use launch::Completion;
