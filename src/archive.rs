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

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::errors::*;

/// The gzipped TAR holding the preprocessed sources and manifests.
/// Directory entries must be added before the files under them.
pub struct Archive {
    builder: tar::Builder<GzEncoder<File>>,
}

impl Archive {
    /// Create the archive next to `dir`: a directory name `out/preprocess`
    /// becomes `out/preprocess.tar.gz`.
    pub fn create(dir: &Path) -> Result<Archive> {
        let output = dir.with_extension("tar.gz");
        let file = File::create(&output)
            .chain_err(|| ErrorKind::ArchiveWrite(format!("cannot create {}", output.display())))?;
        let encoder = GzEncoder::new(file, Compression::default());
        Ok(Archive {
            builder: tar::Builder::new(encoder),
        })
    }

    fn append(&mut self, path: &Path, is_file: bool, data: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(if is_file {
            tar::EntryType::Regular
        } else {
            tar::EntryType::Directory
        });
        header.set_mode(if is_file { 0o644 } else { 0o777 });
        header.set_size(data.len() as u64);
        self.builder
            .append_data(&mut header, path, data)
            .chain_err(|| ErrorKind::ArchiveWrite(format!("cannot append {}", path.display())))
    }

    pub fn add_dir(&mut self, dir: &Path) -> Result<()> {
        self.append(dir, false, &[])
    }

    pub fn add_file(&mut self, file: &Path, content: &[u8]) -> Result<()> {
        self.append(file, true, content)
    }

    /// Add a file whose content is read from `content_file` on disk.
    pub fn add_file_from(&mut self, file: &Path, content_file: &Path) -> Result<()> {
        let mut content = vec![];
        File::open(content_file)
            .and_then(|mut f| f.read_to_end(&mut content))
            .chain_err(|| {
                ErrorKind::ArchiveWrite(format!("cannot read {}", content_file.display()))
            })?;
        self.add_file(file, &content)
    }

    /// Flush and close the archive.
    pub fn finish(self) -> Result<()> {
        self.builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .and_then(|mut file| {
                use std::io::Write;
                file.flush()
            })
            .chain_err(|| ErrorKind::ArchiveWrite("cannot finish archive".into()))
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;

    /// Read back entries as path -> (is_file, mode, content).
    pub fn read_archive(path: &Path) -> BTreeMap<String, (bool, u32, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let is_file = entry.header().entry_type() == tar::EntryType::Regular;
            let mode = entry.header().mode().unwrap();
            let mut content = vec![];
            entry.read_to_end(&mut content).unwrap();
            entries.insert(path.trim_end_matches('/').to_string(), (is_file, mode, content));
        }
        entries
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut archive = Archive::create(&dir.path().join("preprocess")).unwrap();
        archive.add_file(Path::new("xcalibyte.properties"), b"").unwrap();
        archive.add_dir(Path::new("a.out.dir/preprocess")).unwrap();
        archive
            .add_file(Path::new("a.out.dir/preprocess/a.c.i"), b"int main;\n")
            .unwrap();
        archive.finish().unwrap();

        let entries = read_archive(&dir.path().join("preprocess.tar.gz"));
        assert_eq!(entries.len(), 3);
        let (is_file, mode, content) = &entries["a.out.dir/preprocess/a.c.i"];
        assert!(*is_file);
        assert_eq!(*mode, 0o644);
        assert_eq!(content, b"int main;\n");
        let (is_file, mode, _) = &entries["a.out.dir/preprocess"];
        assert!(!*is_file);
        assert_eq!(*mode, 0o777);
        assert!(entries["xcalibyte.properties"].2.is_empty());
    }

    #[test]
    fn test_add_file_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("content.i");
        std::fs::write(&src, b"preprocessed\n").unwrap();
        let mut archive = Archive::create(&dir.path().join("preprocess")).unwrap();
        archive.add_file_from(Path::new("x.dir/a.i"), &src).unwrap();
        archive.finish().unwrap();
        let entries = read_archive(&dir.path().join("preprocess.tar.gz"));
        assert_eq!(entries["x.dir/a.i"].2, b"preprocessed\n");
    }
}
