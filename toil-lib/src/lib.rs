// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

pub use self::env::Env;
pub use self::job::{Job, Resources, Workflow};
pub use self::paths::Paths;
pub use self::store::{FileId, FileStore};
pub use self::timing::Timing;

pub mod env;
pub mod environment;
pub mod files;
pub mod job;
pub mod paths;
pub mod programs;
pub mod runtime;
pub mod spark;
pub mod store;
pub mod timing;
pub mod tools;
pub mod urls;
pub mod util;
pub mod validators;
pub mod wrapper;
