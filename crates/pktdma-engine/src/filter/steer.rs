//! Receive steering rules.
//!
//! Decides which netif a received packet belongs to before any program
//! runs. Rules are kept in match order: rules bound to a channel come first,
//! sorted by channel and then priority, followed by the channel-less rules
//! sorted by priority. The first matching rule wins.

use pktdma_core::{Error, PKT_HDR_SIZE, PacketHeader};
use tracing::debug;

/// Most rules a table holds; ids run from 1 to this value
pub const MAX_STEER_RULES: u32 = 128;

/// Where a matching packet goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerDest {
    /// The named netif, through its program
    Netif(u32),
    /// The host stack, bypassing every program
    Stack,
}

/// Masked byte match over a packet's metadata and frame
///
/// The compared bytes are the `oob_len` metadata bytes at `oob_offset`
/// followed by the `pkt_len` frame bytes at `pkt_offset`; `pattern` and
/// `mask` cover both ranges back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteerRule {
    /// Rule id (0 = assign the lowest free id)
    pub id: u32,
    /// Lower values match first
    pub priority: u32,
    /// Only match packets on this channel
    pub chan: Option<u32>,
    /// Match every packet, ignoring the byte ranges
    pub match_any: bool,
    /// Metadata range start
    pub oob_offset: usize,
    /// Metadata range length
    pub oob_len: usize,
    /// Frame range start
    pub pkt_offset: usize,
    /// Frame range length
    pub pkt_len: usize,
    /// Expected bytes after masking
    pub pattern: Vec<u8>,
    /// Mask applied before comparing
    pub mask: Vec<u8>,
    /// Destination
    pub dest: SteerDest,
}

impl SteerRule {
    /// Rule matching every packet
    pub fn new(dest: SteerDest) -> Self {
        Self {
            id: 0,
            priority: 0,
            chan: None,
            match_any: true,
            oob_offset: 0,
            oob_len: 0,
            pkt_offset: 0,
            pkt_len: 0,
            pattern: Vec::new(),
            mask: Vec::new(),
            dest,
        }
    }

    /// Match `pattern` under `mask` at frame offset `offset`
    pub fn match_frame(mut self, offset: usize, pattern: &[u8], mask: &[u8]) -> Self {
        self.match_any = false;
        self.pkt_offset = offset;
        self.pkt_len = pattern.len();
        self.pattern.truncate(self.oob_len);
        self.mask.truncate(self.oob_len);
        self.pattern.extend_from_slice(pattern);
        self.mask.extend_from_slice(mask);
        self
    }

    /// Restrict the rule to channel `chan`
    pub fn on_chan(mut self, chan: u32) -> Self {
        self.chan = Some(chan);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.match_any {
            return Ok(());
        }
        let total = self.oob_len + self.pkt_len;
        if total == 0 || self.pattern.len() != total || self.mask.len() != total {
            return Err(Error::Param(format!(
                "steering rule pattern/mask must cover {} bytes",
                total
            )));
        }
        Ok(())
    }

    /// Whether a packet on `chan` matches; `buf` starts at its internal header
    pub fn matches(&self, chan: u32, buf: &[u8]) -> bool {
        if self.chan.is_some_and(|c| c != chan) {
            return false;
        }
        if self.match_any {
            return true;
        }
        let Ok(hdr) = PacketHeader::read(buf) else {
            return false;
        };

        let oob = PKT_HDR_SIZE + self.oob_offset;
        let pkt = hdr.frame_offset() + self.pkt_offset;
        let (Some(oob_bytes), Some(pkt_bytes)) = (
            buf.get(oob..oob + self.oob_len),
            buf.get(pkt..pkt + self.pkt_len),
        ) else {
            return false;
        };

        oob_bytes
            .iter()
            .chain(pkt_bytes)
            .zip(self.mask.iter().zip(&self.pattern))
            .all(|(b, (m, p))| b & m == *p)
    }

    fn sorts_before(&self, other: &SteerRule) -> bool {
        match (self.chan, other.chan) {
            (Some(mine), Some(theirs)) => {
                mine < theirs || (mine == theirs && self.priority < other.priority)
            }
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => self.priority < other.priority,
        }
    }
}

/// Ordered rule table
#[derive(Debug, Default)]
pub struct SteerTable {
    rules: Vec<SteerRule>,
}

impl SteerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule, returning its id
    ///
    /// # Errors
    ///
    /// [`Error::Param`] for a malformed rule, an id out of range or a full
    /// table; [`Error::Exists`] if the requested id is taken.
    pub fn create(&mut self, mut rule: SteerRule) -> Result<u32, Error> {
        rule.validate()?;
        if self.rules.len() >= MAX_STEER_RULES as usize {
            return Err(Error::Param(format!(
                "steering table full ({} rules)",
                MAX_STEER_RULES
            )));
        }

        if rule.id == 0 {
            rule.id = (1..=MAX_STEER_RULES)
                .find(|id| self.get(*id).is_none())
                .ok_or_else(|| Error::Param("no free steering rule id".into()))?;
        } else if rule.id > MAX_STEER_RULES {
            return Err(Error::Param(format!("steering rule id {} out of range", rule.id)));
        } else if self.get(rule.id).is_some() {
            return Err(Error::Exists(format!("steering rule {}", rule.id)));
        }

        let pos = self
            .rules
            .iter()
            .position(|r| rule.sorts_before(r))
            .unwrap_or(self.rules.len());
        let id = rule.id;
        debug!("steer: rule {} at position {} -> {:?}", id, pos, rule.dest);
        self.rules.insert(pos, rule);
        Ok(id)
    }

    /// Remove rule `id`
    ///
    /// # Errors
    ///
    /// [`Error::Param`] for an id outside `1..=MAX_STEER_RULES`,
    /// [`Error::NotFound`] if no such rule exists.
    pub fn destroy(&mut self, id: u32) -> Result<(), Error> {
        if id == 0 || id > MAX_STEER_RULES {
            return Err(Error::Param(format!("steering rule id {} out of range", id)));
        }
        let pos = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("steering rule {}", id)))?;
        self.rules.remove(pos);
        Ok(())
    }

    /// Rule `id`
    pub fn get(&self, id: u32) -> Option<&SteerRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Rules in match order
    pub fn rules(&self) -> &[SteerRule] {
        &self.rules
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Destination of a packet on `chan`
    ///
    /// # Errors
    ///
    /// [`Error::NoHandler`] for an empty table, [`Error::NotFound`] when no
    /// rule matches.
    pub fn lookup(&self, chan: u32, buf: &[u8]) -> Result<SteerDest, Error> {
        if self.rules.is_empty() {
            return Err(Error::NoHandler);
        }
        self.rules
            .iter()
            .find(|r| r.matches(chan, buf))
            .map(|r| r.dest)
            .ok_or_else(|| Error::NotFound("steering rule".into()))
    }
}
