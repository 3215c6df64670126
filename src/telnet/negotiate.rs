//! The per-connection negotiation state machine.
//!
//! Runs once per inbound connection, before a session exists: banner timing,
//! NEW-ENVIRON, terminal type, and window size, each bounded by a timeout.
//! Clients vary wildly in how much of this they cooperate with, so every
//! step has a fallback and expiry always falls through to the next
//! strategy; a timeout here is never an error. Only a socket error or a
//! detected close aborts, in which case no session is spawned.

use std::sync::OnceLock;
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use super::{TelnetError, TelnetStream, NEW_ENVIRON, TERM_UNDETECTED};

/// Upper bound on each negotiation poll loop.
pub const TIME_WAIT: Duration = Duration::from_millis(1250);
/// Quiet interval treated as "the client is done answering".
pub const TIME_PAUSE: Duration = Duration::from_millis(1750);
/// Poll granularity.
pub const TIME_POLL: Duration = Duration::from_millis(100);
/// Grace period for clients that negotiate on their own at connect.
const TIME_BANNER: Duration = Duration::from_millis(250);

struct WinsizeQuery {
    term: &'static str,
    query: &'static str,
    pattern: Regex,
}

/// Cursor-position fallback per terminal family, tried in order: park the
/// cursor at 999;999 and ask where it really ended up. See xresize.c from
/// X11.org for the same trick.
fn winsize_queries() -> &'static [WinsizeQuery; 2] {
    static QUERIES: OnceLock<[WinsizeQuery; 2]> = OnceLock::new();
    QUERIES.get_or_init(|| {
        [
            WinsizeQuery {
                term: "vt100",
                query: "\x1b[6n",
                pattern: Regex::new(r"\x1b\[(\d+);(\d+)R").unwrap(),
            },
            WinsizeQuery {
                term: "sun",
                query: "\x1b[18t",
                pattern: Regex::new(r"\x1b\[8;(\d+);(\d+)t").unwrap(),
            },
        ]
    })
}

/// Match a cursor-position report against one family's pattern, yielding
/// `(rows, columns)`.
fn parse_winsize(pattern: &Regex, response: &str) -> Option<(u16, u16)> {
    let captures = pattern.captures(response)?;
    let rows = captures.get(1)?.as_str().parse().ok()?;
    let columns = captures.get(2)?.as_str().parse().ok()?;
    Some((rows, columns))
}

pub struct Negotiator<S> {
    client: TelnetStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Negotiator<S> {
    pub fn new(client: TelnetStream<S>) -> Self {
        Self { client }
    }

    /// Drive the whole sequence and hand the connection back, its
    /// environment map (`TERM`, `LINES`, `COLUMNS`, ...) filled in as far as
    /// the client allowed.
    pub async fn run(mut self) -> Result<TelnetStream<S>, TelnetError> {
        self.banner().await?;
        self.try_env().await?;
        self.try_ttype().await?;
        self.try_naws().await?;
        // disable line wrap; whatever the size probe decided stays true
        self.client.send_str("\x1b[7l").await?;
        // size updates seen during negotiation are already in env; only
        // mid-session changes should become refresh events
        let _ = self.client.take_resize();
        Ok(self.client)
    }

    /// Allow natural client negotiation, then announce ours: will echo,
    /// will suppress-go-ahead, do suppress-go-ahead. Wait for a first byte
    /// and one more quiet period, then move on; client cooperation is
    /// optional.
    async fn banner(&mut self) -> Result<(), TelnetError> {
        tokio::time::sleep(TIME_BANNER).await;
        self.client.request_will_echo().await?;
        self.client.request_will_sga().await?;
        self.client.request_do_sga().await?;

        let start = Instant::now();
        let mark = self.client.bytes_received();
        while self.client.bytes_received() == mark && start.elapsed() < TIME_BANNER {
            self.client.pump(TIME_POLL).await?;
        }
        self.client.pump(TIME_POLL * 2).await?;
        Ok(())
    }

    /// Ask unix-ish clients for their environment variables.
    async fn try_env(&mut self) -> Result<(), TelnetError> {
        if self.client.remote_option(NEW_ENVIRON).is_enabled() {
            debug!("{}: environment enabled (unsolicited)", self.client.peer());
            return Ok(());
        }
        debug!("{}: request-do-env", self.client.peer());
        self.client.request_do_env().await?;
        let start = Instant::now();
        while self.client.remote_option(NEW_ENVIRON).is_unknown() && start.elapsed() < TIME_WAIT {
            self.client.pump(TIME_POLL).await?;
        }
        if self.client.remote_option(NEW_ENVIRON).is_unknown() {
            debug!("{}: failed: NEW_ENVIRON", self.client.peer());
        }
        Ok(())
    }

    /// Negotiate terminal type unless the environment probe already told us.
    async fn try_ttype(&mut self) -> Result<(), TelnetError> {
        if self.client.term() != TERM_UNDETECTED {
            info!("{}: terminal type: {} (unsolicited)", self.client.peer(), self.client.term());
            return Ok(());
        }
        debug!("{}: request-terminal-type", self.client.peer());
        self.client.request_do_ttype().await?;
        let start = Instant::now();
        while self.client.term() == TERM_UNDETECTED && start.elapsed() < TIME_WAIT {
            self.client.pump(TIME_POLL).await?;
        }
        if self.client.term() == TERM_UNDETECTED {
            warn!("{}: failed: terminal type not determined", self.client.peer());
        } else {
            info!("{}: terminal type: {} (negotiated)", self.client.peer(), self.client.term());
        }
        Ok(())
    }

    fn winsize_known(&self) -> bool {
        self.client.env().contains_key("LINES") && self.client.env().contains_key("COLUMNS")
    }

    /// Negotiate about window size, falling back to the cursor-position
    /// trick, falling back to 80x24.
    async fn try_naws(&mut self) -> Result<(), TelnetError> {
        let peer = self.client.peer().to_owned();
        if self.winsize_known() {
            debug!(
                "{}: window size: {}x{} (unsolicited)",
                peer,
                self.client.env()["COLUMNS"],
                self.client.env()["LINES"],
            );
        }
        self.client.request_do_naws().await?;
        let start = Instant::now();
        while !self.winsize_known() && start.elapsed() < TIME_WAIT {
            self.client.pump(TIME_POLL).await?;
        }
        if self.winsize_known() {
            info!(
                "{}: window size: {}x{} (negotiated)",
                peer,
                self.client.env()["COLUMNS"],
                self.client.env()["LINES"],
            );
            return Ok(());
        }
        debug!("{peer}: failed: negotiate about window size");

        // Try #2, works on most any screen: park the cursor in the far
        // corner and ask each terminal family where it actually is. As a
        // bonus, a match identifies an undetected TERM.
        self.client.take_input();
        self.client.send_str("\x1b[s").await?;
        for query in winsize_queries() {
            debug!("{peer}: move-to corner & query for {}", query.term);
            self.client.send_str("\x1b[999;999H").await?;
            self.client.send_str(query.query).await?;
            let start = Instant::now();
            while self.client.idle() < TIME_PAUSE && start.elapsed() < TIME_WAIT {
                self.client.pump(TIME_POLL).await?;
            }
            let input = self.client.take_input();
            self.client.send_str("\x1b[u").await?;
            let response = String::from_utf8_lossy(&input);
            if let Some((rows, columns)) = parse_winsize(&query.pattern, &response) {
                info!("{peer}: window size: {columns}x{rows} (corner-query hack)");
                if self.client.term() == TERM_UNDETECTED {
                    warn!("{peer}: TERM set to {} by corner query", query.term);
                    self.client.env_mut().insert("TERM".to_owned(), query.term.to_owned());
                }
                self.client.env_mut().insert("LINES".to_owned(), rows.to_string());
                self.client.env_mut().insert("COLUMNS".to_owned(), columns.to_string());
                return Ok(());
            }
        }

        debug!("{peer}: window size: 80x24 (default)");
        self.client.env_mut().insert("LINES".to_owned(), "24".to_owned());
        self.client.env_mut().insert("COLUMNS".to_owned(), "80".to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vt100_report_parses_rows_then_columns() {
        let queries = winsize_queries();
        assert_eq!(parse_winsize(&queries[0].pattern, "\x1b[24;80R"), Some((24, 80)));
        assert_eq!(parse_winsize(&queries[0].pattern, "garbage"), None);
    }

    #[test]
    fn sun_report_parses_rows_then_columns() {
        let queries = winsize_queries();
        assert_eq!(parse_winsize(&queries[1].pattern, "\x1b[8;50;132t"), Some((50, 132)));
        // a vt100 report must not satisfy the sun pattern
        assert_eq!(parse_winsize(&queries[1].pattern, "\x1b[24;80R"), None);
    }
}
