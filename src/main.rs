// Copyright 2022 Xcalibyte Limited
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod archive;
mod build;
mod cdb;
mod cmdline;
mod config;
mod errors;
mod prober;
mod processor;
mod profile;
#[cfg(test)]
mod test;
mod tracer;
mod util;

use std::env;
use std::fs;

use log::{error, info, warn};

use crate::build::BuildProcessor;
use crate::cmdline::Options;
use crate::config::Config;
use crate::errors::*;
use crate::profile::ToolchainProfile;
use crate::tracer::Tracer;

fn init_logging(options: &Options) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(if options.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    if options.local_log {
        match fs::File::create(options.output_dir.join("scanprep.log")) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot create log file: {}", e),
        }
    }
    // Tests may have initialized a logger already.
    let _ = builder.try_init();
}

fn run() -> i32 {
    // Compiler output parsing relies on untranslated messages and paths.
    #[cfg(unix)]
    env::set_var("LC_ALL", "C");

    let options = match cmdline::parse() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}", e);
            return exit_code(e.kind());
        }
    };

    let config = match Config::load(&options.tool_root) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return exit_code(e.kind());
        }
    };

    init_logging(&options);

    info!("Build dir: {}", options.build_dir.display());
    info!("Output dir: {}", options.output_dir.display());
    info!("Prebuild command: {}", options.prebuild);
    info!("Build command: {}", options.build_commands.join(" "));
    info!("Trace ID: {}", options.trace_id);
    info!("Span ID: {}", options.span_id);
    info!("Logging to local file: {}", options.local_log);

    info!("Load toolchain profile as specified");
    let toolchain = match ToolchainProfile::load_dir(&options.toolchain_profile) {
        Ok(toolchain) => toolchain,
        Err(e) => {
            error!("{}", e);
            return exit_code(e.kind());
        }
    };

    info!("Trace the native build");
    let tracer = Tracer::new(&options, &config, &toolchain);
    let trace_failure = match tracer.trace() {
        Ok(()) => None,
        Err(e) => match e.kind() {
            // A failing build still leaves captured entries behind; keep
            // going and surface the code at the end.
            ErrorKind::CompilationFailure(code) => {
                warn!("Build tracer exited with compilation failure: {}", code);
                Some(exit_code(e.kind()))
            }
            _ => {
                error!("{}", e);
                return exit_code(e.kind());
            }
        },
    };

    let processor = BuildProcessor::new(toolchain, options, &config);
    if let Err(e) = processor.process() {
        error!("{}", e);
        return exit_code(e.kind());
    }

    trace_failure.unwrap_or(0)
}

fn main() {
    std::process::exit(run());
}
