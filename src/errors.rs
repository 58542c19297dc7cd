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

use error_chain::error_chain;

error_chain! {
    foreign_links {
        Io(std::io::Error);
        Json(serde_json::Error);
    }

    errors {
        IncorrectCommandLine(msg: String) {
            description("incorrect command line")
            display("incorrect command line: {}", msg)
        }
        CdbParse {
            description("error parsing compile database")
            display("error parsing compile database")
        }
        IncorrectConfig(msg: String) {
            description("incorrect config file")
            display("incorrect config file: {}", msg)
        }
        IncorrectProfile(msg: String) {
            description("incorrect toolchain profile")
            display("incorrect toolchain profile: {}", msg)
        }
        ArchiveWrite(msg: String) {
            description("error writing output archive")
            display("error writing output archive: {}", msg)
        }
        TracerNotFound(tracer: String) {
            description("build tracer not found")
            display("`{}` not found, please install it, or choose a different tracing method", tracer)
        }
        CompilationFailure(code: i32) {
            description("traced build failed")
            display("traced build failed with exit code {}", code)
        }
    }
}

// Who could resolve the issue.
const ASSIGNEE_INTERNAL: u32 = 0x1;
const ASSIGNEE_USER: u32 = 0x3;

// Where during the scan process the problem arises.
const PROCESS_BUILD: u32 = 0x3;

// Which party is the cause of the issue.
const CAUSE_USER: u32 = 0x0;
const CAUSE_INTERNAL: u32 = 0x3;

// Whether the code is surfaced to the end user.
const VISIBLE: u32 = 0x0;

// The problem descriptor, which is also the process exit status.
const DESC_UNKNOWN: u32 = 0x1;
const DESC_INCORRECT_COMMAND_LINE: u32 = 0x2;
const DESC_ERROR_PARSING_CDB: u32 = 0x3;
const DESC_INCORRECT_CONFIG_FILE: u32 = 0x4;
const DESC_INCORRECT_TOOLCHAIN_PROFILE: u32 = 0x5;
const DESC_ARCHIVE_ERROR: u32 = 0x6;
const DESC_TRACER_NOT_FOUND: u32 = 0x7;
const DESC_COMPILATION_FAILURE: u32 = 0x8;

const fn gen_ec(assignee: u32, process: u32, cause: u32, visibility: u32, desc: u32) -> u32 {
    (assignee << 20) | (process << 16) | (cause << 12) | (visibility << 8) | desc
}

/// Full error code for a failure, following the error-code table shared with
/// the calling service. The low byte doubles as the process exit status.
pub fn error_code(kind: &ErrorKind) -> u32 {
    match kind {
        ErrorKind::IncorrectCommandLine(_) => gen_ec(
            ASSIGNEE_INTERNAL,
            PROCESS_BUILD,
            CAUSE_INTERNAL,
            VISIBLE,
            DESC_INCORRECT_COMMAND_LINE,
        ),
        ErrorKind::CdbParse => gen_ec(
            ASSIGNEE_INTERNAL,
            PROCESS_BUILD,
            CAUSE_INTERNAL,
            VISIBLE,
            DESC_ERROR_PARSING_CDB,
        ),
        ErrorKind::IncorrectConfig(_) => gen_ec(
            ASSIGNEE_INTERNAL,
            PROCESS_BUILD,
            CAUSE_INTERNAL,
            VISIBLE,
            DESC_INCORRECT_CONFIG_FILE,
        ),
        ErrorKind::IncorrectProfile(_) => gen_ec(
            ASSIGNEE_USER,
            PROCESS_BUILD,
            CAUSE_USER,
            VISIBLE,
            DESC_INCORRECT_TOOLCHAIN_PROFILE,
        ),
        ErrorKind::ArchiveWrite(_) => gen_ec(
            ASSIGNEE_INTERNAL,
            PROCESS_BUILD,
            CAUSE_INTERNAL,
            VISIBLE,
            DESC_ARCHIVE_ERROR,
        ),
        ErrorKind::TracerNotFound(_) => gen_ec(
            ASSIGNEE_USER,
            PROCESS_BUILD,
            CAUSE_USER,
            VISIBLE,
            DESC_TRACER_NOT_FOUND,
        ),
        ErrorKind::CompilationFailure(_) => gen_ec(
            ASSIGNEE_USER,
            PROCESS_BUILD,
            CAUSE_USER,
            VISIBLE,
            DESC_COMPILATION_FAILURE,
        ),
        _ => gen_ec(
            ASSIGNEE_INTERNAL,
            PROCESS_BUILD,
            CAUSE_INTERNAL,
            VISIBLE,
            DESC_UNKNOWN,
        ),
    }
}

/// Process exit status for a failure: the low byte of the full code.
pub fn exit_code(kind: &ErrorKind) -> i32 {
    (error_code(kind) & 0xff) as i32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exit_codes_are_descriptors() {
        assert_eq!(exit_code(&ErrorKind::IncorrectCommandLine("x".into())), 2);
        assert_eq!(exit_code(&ErrorKind::CdbParse), 3);
        assert_eq!(exit_code(&ErrorKind::IncorrectConfig("x".into())), 4);
        assert_eq!(exit_code(&ErrorKind::IncorrectProfile("x".into())), 5);
        assert_eq!(exit_code(&ErrorKind::ArchiveWrite("x".into())), 6);
        assert_eq!(exit_code(&ErrorKind::TracerNotFound("strace".into())), 7);
        assert_eq!(exit_code(&ErrorKind::CompilationFailure(1)), 8);
    }

    #[test]
    fn test_error_code_fields() {
        // User-resolvable codes carry the user assignee and cause nibbles.
        let code = error_code(&ErrorKind::IncorrectProfile("x".into()));
        assert_eq!(code >> 20, 0x3);
        assert_eq!((code >> 16) & 0xf, 0x3);
        assert_eq!((code >> 12) & 0xf, 0x0);
        assert_eq!(code & 0xff, 5);
    }

    #[test]
    fn test_unexpected_errors_map_to_unknown() {
        let err: Error = "boom".into();
        assert_eq!(exit_code(err.kind()), 1);
    }
}
