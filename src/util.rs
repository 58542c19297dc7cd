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

use std::path::{Component, Path, PathBuf};

use sha1::{Digest as _, Sha1};
use uuid::Uuid;

/// Hash the contents of the preprocessed outputs and properties files that
/// end up in the checksum manifest.
pub struct Digest {
    inner: Sha1,
}

impl Digest {
    pub fn new() -> Digest {
        Digest { inner: Sha1::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for Digest {
    fn default() -> Digest {
        Digest::new()
    }
}

/// Lexically normalize a path: strip `.` components and resolve `..` against
/// the preceding component where possible. Symlinks are not consulted, the
/// archived paths only need to be stable, not canonical.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last = out.components().next_back();
                let last_is_normal = matches!(last, Some(Component::Normal(_)));
                let last_is_root =
                    matches!(last, Some(Component::RootDir) | Some(Component::Prefix(_)));
                if last_is_normal {
                    out.pop();
                } else if !last_is_root {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            c => out.push(c.as_os_str()),
        }
    }
    out
}

/// Complete `path` against `dir` and normalize, mirroring how the traced
/// command line would have resolved it.
pub fn full_path(path: &str, dir: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        normalize(p)
    } else {
        normalize(&dir.join(p))
    }
}

/// `full_path` as a string, the form kept in parsed work items and results.
pub fn full_path_str(path: &str, dir: &Path) -> String {
    full_path(path, dir).to_string_lossy().into_owned()
}

/// Resolve the binary of a traced invocation so it can be re-invoked: bare
/// names go through PATH, anything with a directory part resolves against
/// the entry's working directory. Falls back to the name as given, letting
/// the spawn report the failure.
pub fn resolve_binary(binary: &str, dir: &Path) -> PathBuf {
    let p = Path::new(binary);
    if p.file_name() == Some(p.as_os_str()) {
        match which::which(binary) {
            Ok(found) => found,
            Err(_) => p.to_path_buf(),
        }
    } else {
        full_path(binary, dir)
    }
}

/// A fresh unique path under `base`. The caller owns cleanup.
pub fn temp_path(base: &Path) -> PathBuf {
    base.join(format!("{}", Uuid::new_v4().to_simple()))
}

/// The stem used for binary-name lookups: file name with the executable
/// extension stripped, case-folded on Windows.
pub fn binary_stem(binary: &str) -> String {
    let path = Path::new(binary);
    let stem = path
        .file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    #[cfg(windows)]
    let stem = stem.to_lowercase();
    stem
}

/// Last path component as a string, used for filter matching and short names.
pub fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_digest_determinism() {
        let mut a = Digest::new();
        a.update(b"int main() {}\n");
        let mut b = Digest::new();
        b.update(b"int main() {}\n");
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_digest_known_value() {
        let mut d = Digest::new();
        d.update(b"abc");
        assert_eq!(d.finish(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), Path::new("/a/c/d"));
        assert_eq!(normalize(Path::new("/a/../../b")), Path::new("/b"));
        assert_eq!(normalize(Path::new("../x")), Path::new("../x"));
        assert_eq!(normalize(Path::new("a/./b")), Path::new("a/b"));
    }

    #[test]
    fn test_full_path() {
        assert_eq!(
            full_path_str("test1.c", Path::new("/work")),
            "/work/test1.c"
        );
        assert_eq!(
            full_path_str("/tmp/abc.s", Path::new("/work")),
            "/tmp/abc.s"
        );
        assert_eq!(
            full_path_str("../lib/a.c", Path::new("/work/sub")),
            "/work/lib/a.c"
        );
    }

    #[test]
    fn test_binary_stem() {
        assert_eq!(binary_stem("/usr/bin/gcc"), "gcc");
        assert_eq!(binary_stem("cl.exe"), "cl");
        assert_eq!(binary_stem("arm-none-eabi-gcc"), "arm-none-eabi-gcc");
    }

    #[test]
    fn test_temp_paths_are_unique() {
        let a = temp_path(Path::new("/tmp"));
        let b = temp_path(Path::new("/tmp"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/x/lib.a"), "lib.a");
        assert_eq!(basename("a.out"), "a.out");
        assert_eq!(basename(""), "");
    }
}
