use csv::{Writer, WriterBuilder};
use std::fs::File;
use std::path::PathBuf;

use crate::SimulationError;

/// A CSV writer that batches rows in memory and flushes to disk once the
/// batch fills up (or when forced). Rows are written as raw records because
/// the result tables have one column per node, which is not known at compile
/// time.
pub struct BatchedWriter {
    batch_size: u32,
    counter: u32,
    writer: Writer<File>,
}

impl BatchedWriter {
    /// Creates a new writer and the results file that output will be written to.
    pub fn new(
        directory: PathBuf,
        file_name: String,
        batch_size: u32,
    ) -> Result<BatchedWriter, SimulationError> {
        let file = directory.join(file_name);

        let writer = WriterBuilder::new()
            .flexible(true)
            .from_path(file)
            .map_err(SimulationError::CsvError)?;

        Ok(BatchedWriter {
            batch_size,
            counter: 1,
            writer,
        })
    }

    /// Adds a row to the batch to be written, flushing to disk if the batch
    /// size has been reached.
    pub fn queue<I, S>(&mut self, record: I) -> Result<(), SimulationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        // If there's an error writing a row, flush what we have and exit
        // with an error.
        self.writer.write_record(record).map_err(|e| {
            if let Err(e) = self.write(true) {
                log::error!("Error flushing to disk: {e}");
            }

            SimulationError::CsvError(e)
        })?;

        // Otherwise increment counter and flush if we've reached batch size.
        self.counter = self.counter % self.batch_size + 1;
        self.write(false)
    }

    /// Writes the contents of the batched writer to disk. Will result in a
    /// write if force is true _or_ the batch is full.
    pub fn write(&mut self, force: bool) -> Result<(), SimulationError> {
        if force || self.batch_size == self.counter {
            return self
                .writer
                .flush()
                .map_err(|e| SimulationError::CsvError(e.into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rows_reach_disk_after_a_forced_flush() {
        let dir = std::env::temp_dir();
        let file_name = format!("jamsim-batched-writer-test-{}.csv", std::process::id());

        let mut writer = BatchedWriter::new(dir.clone(), file_name.clone(), 100).unwrap();
        writer.queue(["upfront_base_coeff", "sent"]).unwrap();
        writer.queue(["0.5", "42"]).unwrap();
        writer.write(true).unwrap();

        let path = dir.join(&file_name);
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("upfront_base_coeff,sent"));
        assert!(contents.contains("0.5,42"));
        fs::remove_file(path).unwrap();
    }
}
