// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let code = archfs_cat::run(std::env::args_os(), &mut out, &mut io::stderr());
    ExitCode::from(code)
}
