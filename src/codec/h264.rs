// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod nalu_writer;
pub mod parser;
pub mod synthesizer;
