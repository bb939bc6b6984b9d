// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Concurrent transfers when staging a batch of urls
pub const MAX_NETWORK_CONCURRENCY: usize = 8;

/// Attempts for a plain http(s) or file fetch
pub const FETCH_ATTEMPTS: u32 = 5;

/// Attempts for an s3am transfer
pub const S3AM_ATTEMPTS: u32 = 3;

/// Buffer size when hashing file contents
pub const FILE_READ_BUFFER_SIZE: usize = 16 * 1024;
