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

use std::env;
use std::path::{Path, PathBuf};

use clap::{App, AppSettings, Arg, ArgMatches};

use crate::errors::*;
use crate::tracer::TracingMethod;

#[cfg(windows)]
const DEFAULT_TRACING_METHOD: &str = "windbg";
#[cfg(not(windows))]
const DEFAULT_TRACING_METHOD: &str = "dynamic";

#[cfg(windows)]
const DEFAULT_PROFILE: &str = "windows-auto";
#[cfg(not(windows))]
const DEFAULT_PROFILE: &str = "linux-auto";

/// Everything the run needs from the command line.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub build_dir: PathBuf,
    pub output_dir: PathBuf,
    pub prebuild: String,
    /// Directory filter keywords, `;`-separated on the command line.
    pub fkey: String,
    /// Link-target filter keywords, `;`-separated on the command line.
    pub lkey: String,
    /// Command producing the source whitelist, one path per line.
    pub wlfcmd: String,
    /// Command producing the source blacklist, one path per line.
    pub blfcmd: String,
    pub process_link_using_compiler: bool,
    pub debug: bool,
    pub local_log: bool,
    pub trace_id: String,
    pub span_id: String,
    pub tracing_method: TracingMethod,
    pub parallelism: usize,
    pub profile: String,
    /// Installation root, holding `bin/`, `profiles/` and `config`.
    pub tool_root: PathBuf,
    /// Resolved toolchain profile directory.
    pub toolchain_profile: PathBuf,
    /// Whether the profile name asks for auto-detection.
    pub auto_detect: bool,
    /// The native build command, everything after `--`.
    pub build_commands: Vec<String>,
}

fn app() -> App<'static, 'static> {
    App::new("scanprep")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Captures a native build and packages preprocessed sources for scanning")
        .setting(AppSettings::DontCollapseArgsInUsage)
        .arg(
            Arg::with_name("builddir")
                .short("i")
                .long("builddir")
                .takes_value(true)
                .required(true)
                .help("build directory"),
        )
        .arg(
            Arg::with_name("outputdir")
                .short("o")
                .long("outputdir")
                .takes_value(true)
                .required(true)
                .help("output directory"),
        )
        .arg(
            Arg::with_name("prebuild")
                .short("p")
                .long("prebuild")
                .takes_value(true)
                .help("prebuild command, such as 'cmake .' or './configure'"),
        )
        .arg(
            Arg::with_name("fkey")
                .short("f")
                .long("fkey")
                .takes_value(true)
                .help("dir filter keyword, use ; as separator"),
        )
        .arg(
            Arg::with_name("lkey")
                .short("l")
                .long("lkey")
                .takes_value(true)
                .help("link filter keyword, use ; as separator"),
        )
        .arg(
            Arg::with_name("fwl")
                .long("fwl")
                .takes_value(true)
                .help("whitelist files filter command"),
        )
        .arg(
            Arg::with_name("fbl")
                .long("fbl")
                .takes_value(true)
                .help("blacklist files filter command"),
        )
        .arg(
            Arg::with_name("process_link_using_compiler")
                .long("process_link_using_compiler")
                .help("route compiles whose target is linked through the compiler into a synthetic link target"),
        )
        .arg(Arg::with_name("debug").long("debug").help("debug info"))
        .arg(
            Arg::with_name("local_log")
                .long("local_log")
                .help("log to a file under the output directory instead of standard error"),
        )
        .arg(
            Arg::with_name("trace_id")
                .short("t")
                .long("trace_id")
                .takes_value(true)
                .default_value("")
                .help("trace id for logging"),
        )
        .arg(
            Arg::with_name("span_id")
                .short("s")
                .long("span_id")
                .takes_value(true)
                .default_value("")
                .help("span id for logging"),
        )
        .arg(
            Arg::with_name("tracing_method")
                .short("m")
                .long("tracing_method")
                .takes_value(true)
                .default_value(DEFAULT_TRACING_METHOD)
                .help("the method for build tracing, one of 'dynamic', 'static' or 'windbg'"),
        )
        .arg(
            Arg::with_name("parallel")
                .short("j")
                .long("parallel")
                .takes_value(true)
                .default_value("1")
                .help("the preprocessing parallelism"),
        )
        .arg(
            Arg::with_name("profile")
                .long("profile")
                .takes_value(true)
                .default_value(DEFAULT_PROFILE)
                .help("the toolchain profile to be used; *-auto profiles auto-detect"),
        )
        .arg(
            Arg::with_name("build_command")
                .multiple(true)
                .last(true)
                .help("the native build command"),
        )
}

/// Parse the process command line; help and version requests exit here.
pub fn parse() -> Result<Options> {
    let args: Vec<String> = env::args().collect();
    let tool_root = default_tool_root();
    parse_from(args, tool_root)
}

/// The installation root is one level above the binary's directory.
fn default_tool_root() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| {
            exe.parent()
                .and_then(Path::parent)
                .map(Path::to_path_buf)
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn parse_from(args: Vec<String>, tool_root: PathBuf) -> Result<Options> {
    let matches = match app().get_matches_from_safe(args) {
        Ok(matches) => matches,
        Err(e) => {
            if e.kind == clap::ErrorKind::HelpDisplayed
                || e.kind == clap::ErrorKind::VersionDisplayed
            {
                println!("{}", e.message);
                std::process::exit(0);
            }
            return Err(ErrorKind::IncorrectCommandLine(e.message).into());
        }
    };
    validate(&matches, tool_root)
}

fn bad_command_line<T>(msg: String) -> Result<T> {
    Err(ErrorKind::IncorrectCommandLine(msg).into())
}

fn validate(matches: &ArgMatches, tool_root: PathBuf) -> Result<Options> {
    let value = |name: &str| matches.value_of(name).unwrap_or("").to_string();

    let build_dir = PathBuf::from(value("builddir"));
    let output_dir = PathBuf::from(value("outputdir"));

    let build_commands: Vec<String> = matches
        .values_of("build_command")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_default();
    if build_commands.is_empty() {
        return bad_command_line("empty build command".into());
    }

    if !build_dir.exists() {
        return bad_command_line(format!(
            "build directory '{}' does not exist",
            build_dir.display()
        ));
    }
    if !output_dir.exists() {
        return bad_command_line(format!(
            "output directory '{}' does not exist",
            output_dir.display()
        ));
    }

    let method = value("tracing_method");
    let tracing_method = match TracingMethod::from_str(&method) {
        Some(method) => method,
        None => return bad_command_line(format!("invalid tracing method '{}'", method)),
    };

    let parallelism: usize = match value("parallel").parse() {
        Ok(parallelism) if parallelism > 0 => parallelism,
        _ => return bad_command_line(format!("invalid parallelism '{}'", value("parallel"))),
    };

    let profile = value("profile");
    let toolchain_profile = tool_root.join("profiles").join(&profile);
    if !toolchain_profile.exists() {
        return bad_command_line(format!(
            "toolchain profile '{}' does not exist",
            toolchain_profile.display()
        ));
    }
    let auto_detect = profile.ends_with("-auto");

    Ok(Options {
        build_dir,
        output_dir,
        prebuild: value("prebuild"),
        fkey: value("fkey"),
        lkey: value("lkey"),
        wlfcmd: value("fwl"),
        blfcmd: value("fbl"),
        process_link_using_compiler: matches.is_present("process_link_using_compiler"),
        debug: matches.is_present("debug"),
        local_log: matches.is_present("local_log"),
        trace_id: value("trace_id"),
        span_id: value("span_id"),
        tracing_method,
        parallelism,
        profile,
        tool_root,
        toolchain_profile,
        auto_detect,
        build_commands,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stringvec;
    use crate::test::utils::write_file;
    use std::fs;

    fn tool_root_with_profile(name: &str) -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        let profile_dir = dir.path().join("profiles").join(name);
        fs::create_dir_all(&profile_dir).unwrap();
        write_file(&profile_dir.join("profile.json"), "{\"tools\": []}");
        dir
    }

    fn base_args(build: &Path, out: &Path) -> Vec<String> {
        stringvec![
            "scanprep",
            "-i",
            build.to_string_lossy(),
            "-o",
            out.to_string_lossy(),
            "--profile",
            "gnu",
            "--",
            "make",
            "-j4"
        ]
    }

    #[test]
    fn test_parse_minimal() {
        let build = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let root = tool_root_with_profile("gnu");
        let options =
            parse_from(base_args(build.path(), out.path()), root.path().to_path_buf()).unwrap();
        assert_eq!(options.build_dir, build.path());
        assert_eq!(options.output_dir, out.path());
        assert_eq!(options.build_commands, stringvec!["make", "-j4"]);
        assert_eq!(options.parallelism, 1);
        assert_eq!(options.tracing_method, TracingMethod::default());
        assert!(!options.auto_detect);
        assert_eq!(
            options.toolchain_profile,
            root.path().join("profiles").join("gnu")
        );
    }

    #[test]
    fn test_parse_auto_profile() {
        let build = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let root = tool_root_with_profile("linux-auto");
        let mut args = base_args(build.path(), out.path());
        args[6] = "linux-auto".into();
        let options = parse_from(args, root.path().to_path_buf()).unwrap();
        assert!(options.auto_detect);
    }

    #[test]
    fn test_parse_flags() {
        let build = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let root = tool_root_with_profile("gnu");
        let args = stringvec![
            "scanprep",
            "-i",
            build.path().to_string_lossy(),
            "-o",
            out.path().to_string_lossy(),
            "--profile",
            "gnu",
            "-j",
            "8",
            "-m",
            "static",
            "-f",
            "black;vendor",
            "--debug",
            "--local_log",
            "--process_link_using_compiler",
            "--",
            "make"
        ];
        let options = parse_from(args, root.path().to_path_buf()).unwrap();
        assert_eq!(options.parallelism, 8);
        assert_eq!(options.tracing_method, TracingMethod::Strace);
        assert_eq!(options.fkey, "black;vendor");
        assert!(options.debug);
        assert!(options.local_log);
        assert!(options.process_link_using_compiler);
    }

    #[test]
    fn test_parse_errors() {
        let build = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let root = tool_root_with_profile("gnu");

        // No build command after --.
        let args = stringvec![
            "scanprep",
            "-i",
            build.path().to_string_lossy(),
            "-o",
            out.path().to_string_lossy(),
            "--profile",
            "gnu"
        ];
        assert!(parse_from(args, root.path().to_path_buf()).is_err());

        // Bad tracing method.
        let mut args = base_args(build.path(), out.path());
        args.insert(7, "-m".into());
        args.insert(8, "ptrace".into());
        assert!(parse_from(args, root.path().to_path_buf()).is_err());

        // Missing profile directory.
        let mut args = base_args(build.path(), out.path());
        args[6] = "other".into();
        assert!(parse_from(args, root.path().to_path_buf()).is_err());

        // Missing build dir.
        let mut args = base_args(build.path(), out.path());
        args[2] = "/nonexistent-build-dir".into();
        assert!(parse_from(args, root.path().to_path_buf()).is_err());

        // Bad parallelism.
        let mut args = base_args(build.path(), out.path());
        args.insert(7, "-j".into());
        args.insert(8, "zero".into());
        assert!(parse_from(args, root.path().to_path_buf()).is_err());
    }
}
