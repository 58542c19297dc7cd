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

//! Drives the external build tracers over the user's build and leaves a
//! compile database behind. The tracer implementations themselves live
//! outside this crate; this module only invokes them and, for strace,
//! converts their raw output.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::Value;

use crate::cdb::CdbEntry;
use crate::cmdline::Options;
use crate::config::Config;
use crate::errors::*;
use crate::profile::ToolchainProfile;
use crate::util;

/// How the native build is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingMethod {
    /// Library-preload interposer ("dynamic").
    Preload,
    /// System-call tracer ("static").
    Strace,
    /// Debugger-driven process observer ("windbg").
    WinDbg,
}

impl Default for TracingMethod {
    fn default() -> TracingMethod {
        TracingMethod::Preload
    }
}

impl TracingMethod {
    pub fn from_str(s: &str) -> Option<TracingMethod> {
        match s {
            "dynamic" => Some(TracingMethod::Preload),
            "static" => Some(TracingMethod::Strace),
            "windbg" => Some(TracingMethod::WinDbg),
            _ => None,
        }
    }
}

pub struct Tracer {
    method: TracingMethod,
    build_dir: PathBuf,
    cdb_path: PathBuf,
    tool_root: PathBuf,
    prebuild: String,
    build_commands: Vec<String>,
    /// Traced binary names with their response-file configs.
    binaries: BTreeMap<String, Value>,
}

impl Tracer {
    pub fn new(options: &Options, config: &Config, toolchain: &ToolchainProfile) -> Tracer {
        let build_dir =
            fs::canonicalize(&options.build_dir).unwrap_or_else(|_| options.build_dir.clone());
        let output_dir =
            fs::canonicalize(&options.output_dir).unwrap_or_else(|_| options.output_dir.clone());
        Tracer {
            method: options.tracing_method,
            build_dir,
            cdb_path: output_dir.join(config.cdb_name()),
            tool_root: options.tool_root.clone(),
            prebuild: options.prebuild.clone(),
            build_commands: options.build_commands.clone(),
            binaries: toolchain.binaries_to_trace(),
        }
    }

    /// Run the prebuild command and the traced build. A failing build is
    /// reported as `CompilationFailure`; the caller keeps going with
    /// whatever entries the tracer recorded.
    pub fn trace(&self) -> Result<()> {
        if !self.prebuild.is_empty() {
            let status = Command::new("sh")
                .arg("-c")
                .arg(&self.prebuild)
                .current_dir(&self.build_dir)
                .status();
            if let Err(e) = status {
                warn!("Failed to run prebuild command '{}': {}", self.prebuild, e);
            }
        }

        let code = match self.method {
            TracingMethod::Preload => {
                info!("Tracing method: preload");
                self.trace_with_preload()
            }
            TracingMethod::Strace => {
                info!("Tracing method: strace");
                self.trace_with_strace()?
            }
            TracingMethod::WinDbg => {
                info!("Tracing method: windbg");
                self.trace_with_windbg()
            }
        };

        if code == 0 {
            debug!("Build tracer exited successfully");
            Ok(())
        } else {
            // Reported, but the pipeline continues with the entries that
            // were captured.
            debug!("Build tracer exited with compilation failure: {}", code);
            Err(ErrorKind::CompilationFailure(code).into())
        }
    }

    fn trace_with_preload(&self) -> i32 {
        let tracer_path = self.tool_root.join("bin").join("unix-tracer");
        // The interposer library paths must be absolute; both word sizes go
        // on the search path so the loader stays quiet.
        let lib_path = format!(
            "{}:{}",
            self.tool_root.join("lib32").display(),
            self.tool_root.join("lib64").display()
        );

        let mut command = Command::new(&tracer_path);
        command
            .arg("-l")
            .arg(&lib_path)
            .arg("-o")
            .arg(&self.cdb_path);
        if !self.binaries.is_empty() {
            let names: Vec<&str> = self.binaries.keys().map(String::as_str).collect();
            command.arg("-c").arg(names.join(","));
        }
        command
            .arg("--")
            .args(&self.build_commands)
            .current_dir(&self.build_dir);

        info!("Run the build command under the preload tracer");
        match command.status() {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                warn!("Failed to run {}, reason: {}", tracer_path.display(), e);
                1
            }
        }
    }

    fn trace_with_strace(&self) -> Result<i32> {
        let strace_path =
            which::which("strace").map_err(|_| ErrorKind::TracerNotFound("strace".to_string()))?;

        let temp_path = util::temp_path(&self.build_dir);
        let status = Command::new(&strace_path)
            .args(&["-f", "-v", "-s", "65535", "-e", "trace=execve", "-o"])
            .arg(&temp_path)
            .args(&self.build_commands)
            .current_dir(&self.build_dir)
            // The recorded PWD is what entries resolve against; start_dir
            // alone does not change it.
            .env("PWD", &self.build_dir)
            .status();

        let code = match status {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                warn!("Failed to run {}, reason: {}", strace_path.display(), e);
                1
            }
        };
        if code != 0 {
            let _ = fs::remove_file(&temp_path);
            return Ok(code);
        }

        let content = fs::read_to_string(&temp_path).unwrap_or_default();
        let cdb = parse_strace_output(&content, &self.binaries);
        fs::write(&self.cdb_path, serde_json::to_string_pretty(&cdb)?)?;

        let _ = fs::remove_file(&temp_path);
        Ok(0)
    }

    fn trace_with_windbg(&self) -> i32 {
        let tracer_path = self.tool_root.join("bin").join("win-tracer.exe");
        let config_file = self.build_dir.join("compiler-config.json");

        let config: Vec<&Value> = self.binaries.values().collect();
        if let Err(e) = serde_json::to_string(&config)
            .map_err(Error::from)
            .and_then(|body| fs::write(&config_file, body + "\n").map_err(Error::from))
        {
            warn!("Failed to write {}: {}", config_file.display(), e);
            return 1;
        }

        let code = match Command::new(&tracer_path)
            .arg("/o")
            .arg(&self.cdb_path)
            .arg("/c")
            .arg(&config_file)
            .args(&self.build_commands)
            .current_dir(&self.build_dir)
            .status()
        {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                warn!("Failed to run {}, reason: {}", tracer_path.display(), e);
                1
            }
        };
        let _ = fs::remove_file(&config_file);
        code
    }
}

lazy_static! {
    // One execve per line, e.g.:
    //   1234  execve("/usr/bin/gcc", ["gcc", "-c", "a.c"], ["PWD=/work", ...]) = 0
    // group 1: binary, group 2: argv as a JSON-ish array, group 3: PWD.
    static ref EXECVE_LINE: Regex = Regex::new(
        "^\\d+\\s+execve\\(\"([^\"]+)\", (\\[[^\\[]+\\]), \\[[^\\[]*\"PWD=([^\"]+)\"[^\\[]*\\](\\) = 0| <unfinished \\.\\.\\.>)$"
    )
    .unwrap();
}

/// Convert raw strace output into compile-database entries, keeping only
/// invocations of traced binaries.
pub fn parse_strace_output(content: &str, binaries: &BTreeMap<String, Value>) -> Vec<CdbEntry> {
    let mut cdb = vec![];
    for line in content.lines() {
        let captures = match EXECVE_LINE.captures(line) {
            Some(captures) => captures,
            None => continue,
        };
        let binary = &captures[1];

        // Filter by binary file name.
        if !binaries.contains_key(&util::basename(binary)) {
            continue;
        }

        let arguments: Vec<String> = match serde_json::from_str(&captures[2]) {
            Ok(arguments) => arguments,
            Err(_) => {
                warn!("Not JSON: {}", &captures[2]);
                continue;
            }
        };

        cdb.push(CdbEntry {
            directory: captures[3].to_string(),
            arguments,
            respfile: None,
        });
    }
    cdb
}
