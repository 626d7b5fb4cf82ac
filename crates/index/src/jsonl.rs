use std::io::Write;

use anyhow::Result;
use serde::Serialize;

/// Newline-delimited JSON sink.
pub struct JsonlWriter<W> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonlWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn write_all<'a, T, I>(&mut self, records: I) -> Result<usize>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        for record in records {
            self.write_record(record)?;
        }
        self.writer.flush()?;
        Ok(self.written)
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn one_record_per_line_without_escaping_cjk() {
        let mut writer = JsonlWriter::new(Vec::new());
        let records = vec![json!({"document": "政策.pdf", "score": 0.5}), json!({"document": "b"})];
        assert_eq!(writer.write_all(&records).unwrap(), 2);
        let out = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("政策.pdf"));
        let parsed: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["document"], "b");
    }
}
