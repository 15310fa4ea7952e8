//! Synthetic source for `stub://` URIs.
//!
//! Frames are RGB with a dark background and a bright block that moves one
//! step to the right on every frame, so the motion backend has something to
//! find. Query parameters shape the stream:
//!
//! | key           | default | meaning                                          |
//! |---------------|---------|--------------------------------------------------|
//! | `width`       | 640     | frame width                                      |
//! | `height`      | 480     | frame height                                     |
//! | `fps`         | 30      | pacing between reads, 0 reads as fast as called  |
//! | `frames`      | none    | reads fail after this many frames per connection |
//! | `fail_every`  | none    | every Nth read on a connection fails             |
//! | `unreachable` | false   | every connect fails                              |

use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use super::{Connection, Connector, SourceUri};
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const BACKGROUND: u8 = 32;
const BLOCK: u8 = 224;

#[derive(Clone, Debug, PartialEq, Eq)]
struct SyntheticParams {
    width: u32,
    height: u32,
    fps: u32,
    frames: Option<u64>,
    fail_every: Option<u64>,
    unreachable: bool,
}

impl SyntheticParams {
    fn from_uri(uri: &SourceUri) -> Result<Self> {
        let params = Self {
            width: param(uri, "width")?.unwrap_or(DEFAULT_WIDTH),
            height: param(uri, "height")?.unwrap_or(DEFAULT_HEIGHT),
            fps: param(uri, "fps")?.unwrap_or(DEFAULT_FPS),
            frames: param(uri, "frames")?,
            fail_every: param::<u64>(uri, "fail_every")?.filter(|n| *n > 0),
            unreachable: param(uri, "unreachable")?.unwrap_or(false),
        };
        if params.width == 0 || params.height == 0 {
            bail!("synthetic source needs a non-zero width and height");
        }
        Ok(params)
    }
}

fn param<T>(uri: &SourceUri, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    uri.query_value(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("invalid stub parameter {}={}", key, raw))
        })
        .transpose()
}

/// Connector for `stub://` sources.
#[derive(Debug, Default)]
pub struct SyntheticConnector {
    connects: u64,
}

impl SyntheticConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for SyntheticConnector {
    fn connect(&mut self, uri: &SourceUri) -> Result<Box<dyn Connection>> {
        let params = SyntheticParams::from_uri(uri)?;
        self.connects += 1;
        if params.unreachable {
            return Err(anyhow!("{} is unreachable", uri));
        }
        log::info!(
            "SyntheticConnection: connected to {} ({}x{}, connect #{})",
            uri,
            params.width,
            params.height,
            self.connects
        );
        Ok(Box::new(SyntheticConnection::new(params)))
    }
}

struct SyntheticConnection {
    params: SyntheticParams,
    interval: Duration,
    reads: u64,
    frames_made: u64,
    next_frame_at: Option<Instant>,
}

impl SyntheticConnection {
    fn new(params: SyntheticParams) -> Self {
        let interval = if params.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / params.fps
        };
        Self {
            params,
            interval,
            reads: 0,
            frames_made: 0,
            next_frame_at: None,
        }
    }

    fn pace(&mut self) {
        if self.interval.is_zero() {
            return;
        }
        let now = Instant::now();
        if let Some(due) = self.next_frame_at {
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_frame_at = Some(Instant::now() + self.interval);
    }

    fn render(&self) -> Vec<u8> {
        let width = self.params.width as usize;
        let height = self.params.height as usize;
        let block = (width.min(height) / 4).max(1);
        let travel = width.saturating_sub(block) + 1;
        let left = (self.frames_made as usize * block.div_ceil(2).max(1)) % travel;
        let top = (height - block.min(height)) / 2;

        let mut pixels = vec![BACKGROUND; width * height * 3];
        for y in top..(top + block).min(height) {
            let row = y * width * 3;
            pixels[row + left * 3..row + (left + block) * 3].fill(BLOCK);
        }
        pixels
    }
}

impl Connection for SyntheticConnection {
    fn read_frame(&mut self) -> Result<Frame> {
        self.reads += 1;
        if let Some(limit) = self.params.frames {
            if self.frames_made >= limit {
                bail!("synthetic stream ended after {} frames", limit);
            }
        }
        if let Some(every) = self.params.fail_every {
            if self.reads % every == 0 {
                bail!("synthetic read {} dropped", self.reads);
            }
        }
        self.pace();
        let pixels = self.render();
        self.frames_made += 1;
        Ok(Frame::from_rgb(self.params.width, self.params.height, pixels)?)
    }

    fn release(&mut self) {
        log::debug!(
            "SyntheticConnection: released after {} frames",
            self.frames_made
        );
    }
}
