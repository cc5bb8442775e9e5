use std::ffi::{OsStr, OsString};
use std::io::Write;

use log::{debug, info};

use crate::bitmap::CoverageBitmap;
use crate::classify::classify_counts;
use crate::config::Config;
use crate::error::Error;
use crate::forkserver::{ExecutionResult, ForkServerClient};
use crate::report::BitmapReporter;

/// Everything a single harness invocation owns. The coverage segment lives exactly as long as
/// the session.
#[derive(Debug)]
pub struct Session {
    config: Config,
    bitmap: CoverageBitmap,
}

impl Session {
    /// Sets up the coverage map and publishes it to all targets started later.
    pub fn new(config: Config) -> Result<Self, Error> {
        let bitmap = CoverageBitmap::setup(config.map_size)?;
        info!(
            "Coverage map of {} bytes in shared memory segment {}",
            bitmap.size(),
            bitmap.shm_id()
        );
        Ok(Self { config, bitmap })
    }

    /// Runs the target once. A termination by signal is reported to `out`, it is not an error.
    pub fn execute<W: Write>(
        &mut self,
        program: &OsStr,
        args: &[OsString],
        out: &mut W,
    ) -> Result<ExecutionResult, Error> {
        let client = ForkServerClient::new(self.config.sink_output);
        let result = client.run(program, args)?;

        info!("Child {} {}", result.child_pid, result.outcome);
        if let Some(signal) = result.outcome.signal() {
            writeln!(out, "+++ Killed by signal {} +++", signal)?;
        }

        Ok(result)
    }

    /// Classifies the map (unless raw counts were requested) and writes the tuple header
    /// followed by every recorded tuple.
    ///
    /// An empty map is an error and nothing is written: either the target is not instrumented
    /// or the handshake lied.
    pub fn report<W: Write>(&mut self, out: &mut W) -> Result<usize, Error> {
        let recorded = BitmapReporter::new(self.bitmap.as_slice()).count_set_entries();
        if recorded == 0 {
            return Err(Error::NoCoverage);
        }
        debug!("{} tuples recorded", recorded);

        writeln!(out, "\nTuples recorded:\n")?;
        if !self.config.raw {
            classify_counts(self.bitmap.as_mut_slice());
        }

        let written = BitmapReporter::new(self.bitmap.as_slice()).write_tuples(out)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpublished_session(config: Config) -> Session {
        let mut bitmap = CoverageBitmap::create(config.map_size).unwrap();
        bitmap.map().unwrap();
        Session { config, bitmap }
    }

    #[test_log::test]
    fn empty_map_is_reported_as_missing_coverage() {
        let mut session = unpublished_session(Config::default());
        let mut out = Vec::new();

        assert_eq!(session.report(&mut out), Err(Error::NoCoverage));
        assert!(out.is_empty());
    }

    #[test_log::test]
    fn report_classifies_counts() {
        let mut session = unpublished_session(Config::default());
        {
            let map = session.bitmap.as_mut_slice();
            map[0] = 5;
            map[42] = 1;
            map[16383] = 200;
        }

        let mut out = Vec::new();
        assert_eq!(session.report(&mut out), Ok(3));
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "\nTuples recorded:\n\n00000/8\n00042/1\n16383/128\n"
        );
    }

    #[test_log::test]
    fn raw_report_keeps_counts() {
        let config = Config {
            raw: true,
            ..Config::default()
        };
        let mut session = unpublished_session(config);
        session.bitmap.as_mut_slice()[9] = 200;

        let mut out = Vec::new();
        assert_eq!(session.report(&mut out), Ok(1));
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "\nTuples recorded:\n\n00009/200\n"
        );
    }

    #[test_log::test]
    fn failed_handshake_writes_nothing() {
        let config = Config {
            sink_output: true,
            ..Config::default()
        };
        let mut session = unpublished_session(config);
        let mut out = Vec::new();

        let result = session.execute(OsStr::new("true"), &[], &mut out);
        assert!(matches!(result, Err(Error::Protocol(_))), "{result:?}");
        assert!(out.is_empty());
    }
}
