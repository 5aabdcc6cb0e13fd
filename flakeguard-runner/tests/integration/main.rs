// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod fixtures;
mod lifecycle;
mod persistence;
mod sampling;
