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

use serde_json::{json, Value};

/// The kind of a traced command.
///
/// Assemble is what bridges link inputs back to compile targets.
/// Example: `gcc -o a.out a.c` runs `cc1 -o tmp.s a.c`, `as -o a.o tmp.s`,
/// `ld -o a.out a.o`; for link target a.out the compile target is tmp.s,
/// not a.o.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Compile,
    Assemble,
    Link,
    Archive,
    Ignore,
}

impl CommandKind {
    pub fn from_str(s: &str) -> Option<CommandKind> {
        match s {
            "compile" => Some(CommandKind::Compile),
            "assemble" => Some(CommandKind::Assemble),
            "link" => Some(CommandKind::Link),
            "archive" => Some(CommandKind::Archive),
            "ignore" => Some(CommandKind::Ignore),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            CommandKind::Compile => "compile",
            CommandKind::Assemble => "assemble",
            CommandKind::Link => "link",
            CommandKind::Archive => "archive",
            CommandKind::Ignore => "ignore",
        }
    }
}

/// Detected format of a file on a traced command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    C,
    Cxx,
    Preprocessed,
    Assembly,
    Object,
    Library,
    Executable,
    /// Decide by file extension.
    ByExtension,
}

impl FileFormat {
    pub fn from_str(s: &str) -> Option<FileFormat> {
        match s {
            "c" => Some(FileFormat::C),
            "c++" => Some(FileFormat::Cxx),
            "preprocessed" => Some(FileFormat::Preprocessed),
            "assembly" => Some(FileFormat::Assembly),
            "object" => Some(FileFormat::Object),
            "library" => Some(FileFormat::Library),
            "executive" => Some(FileFormat::Executable),
            "ext" => Some(FileFormat::ByExtension),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            FileFormat::C => "c",
            FileFormat::Cxx => "c++",
            FileFormat::Preprocessed => "preprocessed",
            FileFormat::Assembly => "assembly",
            FileFormat::Object => "object",
            FileFormat::Library => "library",
            FileFormat::Executable => "executive",
            FileFormat::ByExtension => "ext",
        }
    }
}

/// Result of classifying one compile-database entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWorkItem {
    pub kind: CommandKind,
    /// argv[0] of the invocation.
    pub binary: String,
    /// Working directory of the invocation.
    pub dir: String,
    /// Source language forced by the binary name or a language option.
    pub format: FileFormat,
    /// Source files (absolute path) and their formats.
    pub sources: Vec<(String, FileFormat)>,
    /// Target of the command, e.g. the link target for a linker.
    pub target: String,
    /// Options forwarded to the preprocessing command line.
    pub pp_options: Vec<String>,
    /// C options forwarded to the scanner.
    pub c_scan_options: Vec<String>,
    /// C++ options forwarded to the scanner.
    pub cxx_scan_options: Vec<String>,
}

impl Default for ParsedWorkItem {
    fn default() -> ParsedWorkItem {
        ParsedWorkItem {
            kind: CommandKind::Ignore,
            binary: String::new(),
            dir: String::new(),
            format: FileFormat::ByExtension,
            sources: vec![],
            target: String::new(),
            pp_options: vec![],
            c_scan_options: vec![],
            cxx_scan_options: vec![],
        }
    }
}

impl ParsedWorkItem {
    /// JSON rendering for diagnostics.
    pub fn to_json(&self) -> Value {
        json!({
            "kind": self.kind.as_str(),
            "binary": self.binary,
            "dir": self.dir,
            "target": self.target,
            "fileFormat": self.format.as_str(),
            "sources": self.sources.iter().map(|(file, format)| {
                json!({"file": file, "format": format.as_str()})
            }).collect::<Vec<_>>(),
            "ppOptions": self.pp_options,
            "cScanOptions": self.c_scan_options,
            "cxxScanOptions": self.cxx_scan_options,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_command_kind_round_trip() {
        for kind in &[
            CommandKind::Compile,
            CommandKind::Assemble,
            CommandKind::Link,
            CommandKind::Archive,
            CommandKind::Ignore,
        ] {
            assert_eq!(CommandKind::from_str(kind.as_str()), Some(*kind));
        }
        assert_eq!(CommandKind::from_str("make"), None);
    }

    #[test]
    fn test_file_format_round_trip() {
        for format in &[
            FileFormat::C,
            FileFormat::Cxx,
            FileFormat::Preprocessed,
            FileFormat::Assembly,
            FileFormat::Object,
            FileFormat::Library,
            FileFormat::Executable,
            FileFormat::ByExtension,
        ] {
            assert_eq!(FileFormat::from_str(format.as_str()), Some(*format));
        }
        assert_eq!(FileFormat::from_str(""), None);
    }

    #[test]
    fn test_to_json() {
        let parsed = ParsedWorkItem {
            kind: CommandKind::Compile,
            binary: "gcc".into(),
            dir: "/work".into(),
            sources: vec![("/work/a.c".into(), FileFormat::C)],
            target: "/work/a.o".into(),
            ..Default::default()
        };
        let json = parsed.to_json();
        assert_eq!(json["kind"], "compile");
        assert_eq!(json["sources"][0]["file"], "/work/a.c");
        assert_eq!(json["sources"][0]["format"], "c");
    }
}
