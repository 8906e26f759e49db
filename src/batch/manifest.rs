//! In-memory CSV manifest.
//!
//! Cells are kept as the exact strings that were read, so columns the batch
//! run does not touch are written back unchanged. The input's line ending
//! (`\n` or `\r\n`) is kept; quoting is normalized to the minimal form.

use csv::{QuoteStyle, ReaderBuilder, Terminator, WriterBuilder};
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::batch::BatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    /// Taken from the first line break in the input.
    fn detect(data: &[u8]) -> Self {
        match data.iter().position(|&b| b == b'\n') {
            Some(i) if i > 0 && data[i - 1] == b'\r' => LineEnding::CrLf,
            _ => LineEnding::Lf,
        }
    }

    fn terminator(self) -> Terminator {
        match self {
            LineEnding::Lf => Terminator::Any(b'\n'),
            LineEnding::CrLf => Terminator::CRLF,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    headers: Vec<String>,
    records: Vec<Vec<String>>,
    line_ending: LineEnding,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let file = std::fs::File::open(path).map_err(|e| BatchError::ManifestRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_reader(file).map_err(|e| match e {
            BatchError::ManifestRead { message, .. } => BatchError::ManifestRead {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse CSV with a header row. Short rows are padded with empty cells.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, BatchError> {
        let read_error = |e: csv::Error| BatchError::ManifestRead {
            path: Default::default(),
            message: e.to_string(),
        };

        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| read_error(e.into()))?;
        let line_ending = LineEnding::detect(&data);

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(data.as_slice());

        let headers: Vec<String> = reader
            .headers()
            .map_err(read_error)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut records = Vec::new();
        for record in reader.records() {
            let mut row: Vec<String> = record.map_err(read_error)?.iter().map(str::to_string).collect();
            if row.len() < headers.len() {
                row.resize(headers.len(), String::new());
            }
            records.push(row);
        }

        Ok(Self {
            headers,
            records,
            line_ending,
        })
    }

    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Every value of a column, in record order.
    pub fn column(&self, name: &str) -> Result<Vec<String>, BatchError> {
        let index = self
            .column_index(name)
            .ok_or_else(|| BatchError::MissingColumn(name.to_string()))?;
        Ok(self
            .records
            .iter()
            .map(|row| row.get(index).cloned().unwrap_or_default())
            .collect())
    }

    /// Replace a column wholesale, appending it if it does not exist yet.
    pub fn set_column(&mut self, name: &str, values: Vec<String>) -> Result<(), BatchError> {
        if values.len() != self.records.len() {
            return Err(BatchError::LengthMismatch {
                expected: self.records.len(),
                actual: values.len(),
            });
        }

        let index = match self.column_index(name) {
            Some(index) => index,
            None => {
                self.headers.push(name.to_string());
                self.headers.len() - 1
            }
        };

        for (row, value) in self.records.iter_mut().zip(values) {
            if row.len() <= index {
                row.resize(index + 1, String::new());
            }
            row[index] = value;
        }

        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut writer = WriterBuilder::new()
            .flexible(true)
            .quote_style(QuoteStyle::Necessary)
            .terminator(self.line_ending.terminator())
            .from_writer(writer);

        writer.write_record(&self.headers)?;
        for row in &self.records {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write to a temporary file beside `path`, then rename over it, so a
    /// crash never leaves a half-written manifest.
    pub fn persist(&self, path: &Path) -> Result<(), BatchError> {
        let persist_error = |source: std::io::Error| BatchError::Persist {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut staged = NamedTempFile::new_in(dir).map_err(persist_error)?;
        self.write_to(staged.as_file_mut())
            .map_err(|e| persist_error(e.into()))?;
        staged.as_file_mut().sync_all().map_err(persist_error)?;
        staged.persist(path).map_err(|e| persist_error(e.error))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "filename,text,up_votes,accent\n\
        cv-valid-dev/sample-000000.mp3,be careful with your prognostications,1,\n\
        cv-valid-dev/sample-000001.mp3,\"then, why\",2,us\n";

    fn render(manifest: &Manifest) -> String {
        let mut out = Vec::new();
        manifest.write_to(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let manifest = Manifest::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(render(&manifest), SAMPLE);
    }

    #[test]
    fn test_crlf_line_endings_are_kept() {
        let input = "filename,text\r\na.mp3,hello\r\nb.mp3,\"x, y\"\r\n";
        let mut manifest = Manifest::from_reader(input.as_bytes()).unwrap();
        assert_eq!(manifest.line_ending(), LineEnding::CrLf);
        assert_eq!(manifest.column("text").unwrap(), vec!["hello", "x, y"]);
        assert_eq!(render(&manifest), input);

        manifest
            .set_column("generated_text", vec!["HELLO".into(), String::new()])
            .unwrap();
        assert_eq!(
            render(&manifest),
            "filename,text,generated_text\r\na.mp3,hello,HELLO\r\nb.mp3,\"x, y\",\r\n"
        );
    }

    #[test]
    fn test_lf_is_default_line_ending() {
        let manifest = Manifest::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(manifest.line_ending(), LineEnding::Lf);

        let headers_only = Manifest::from_reader("filename".as_bytes()).unwrap();
        assert_eq!(headers_only.line_ending(), LineEnding::Lf);
        assert!(headers_only.is_empty());
    }

    #[test]
    fn test_column_access() {
        let manifest = Manifest::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(manifest.column("text").unwrap()[1], "then, why");
        assert!(matches!(
            manifest.column("generated_text"),
            Err(BatchError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_set_column_appends_then_overwrites() {
        let mut manifest = Manifest::from_reader(SAMPLE.as_bytes()).unwrap();
        manifest
            .set_column("generated_text", vec!["BE CAREFUL".into(), String::new()])
            .unwrap();
        assert_eq!(manifest.headers().last().unwrap(), "generated_text");

        manifest
            .set_column("generated_text", vec!["A".into(), "B".into()])
            .unwrap();
        assert_eq!(manifest.headers().len(), 5);
        assert_eq!(manifest.column("generated_text").unwrap(), vec!["A", "B"]);

        let err = manifest.set_column("generated_text", vec![]).unwrap_err();
        assert!(matches!(err, BatchError::LengthMismatch { expected: 2, actual: 0 }));
    }

    #[test]
    fn test_short_rows_are_padded() {
        let manifest = Manifest::from_reader("a,b,c\n1\n".as_bytes()).unwrap();
        assert_eq!(manifest.column("c").unwrap(), vec![""]);
        assert_eq!(render(&manifest), "a,b,c\n1,,\n");
    }

    #[test]
    fn test_persist_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.csv");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut manifest = Manifest::load(&path).unwrap();
        manifest
            .set_column("generated_text", vec!["X".into(), "Y".into()])
            .unwrap();
        manifest.persist(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("filename,text,up_votes,accent,generated_text\n"));
        assert!(written.ends_with(",2,us,Y\n"));

        // only the manifest remains, no stray temp files
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_manifest_is_read_error() {
        let err = Manifest::load(Path::new("/nonexistent/manifest.csv")).unwrap_err();
        assert!(matches!(err, BatchError::ManifestRead { .. }));
        assert!(err.to_string().contains("/nonexistent/manifest.csv"));
    }
}
