// SPDX-FileCopyrightText: 2026 ArcheBase
//
// SPDX-License-Identifier: MulanPSL-2.0

//! Filtered, time-ordered cursors over bag messages.
//!
//! A [`View`] collects the index entries of every connection matching a
//! [`Query`] into per-connection sorted streams and iterates them as a
//! single k-way merge, ordered by `(time, chunk_pos, offset)`. Each
//! step yields a lightweight [`MessageInstance`] that materializes the
//! message on demand through the owning bag's chunk cache.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::bag::structures::{ConnectionInfo, IndexEntry};
use crate::bag::Bag;
use crate::codec::TypedMessage;
use crate::core::{BagError, Result};
use crate::io::record::FieldMap;
use crate::types::Time;

/// Connection selector for a query.
#[derive(Clone, Default)]
pub enum TopicFilter {
    /// Select every connection
    #[default]
    All,
    /// Select connections on any of these topics
    Topics(Vec<String>),
    /// Select connections whose topic matches the pattern
    Regex(Arc<Regex>),
    /// Custom predicate over the connection
    Custom(Arc<dyn Fn(&ConnectionInfo) -> bool + Send + Sync>),
}

impl fmt::Debug for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.debug_tuple("All").finish(),
            Self::Topics(topics) => f.debug_tuple("Topics").field(topics).finish(),
            Self::Regex(_) => f.debug_tuple("Regex").field(&"<regex>").finish(),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl TopicFilter {
    /// Select the given topics.
    pub fn topics<I, S>(topics: I) -> TopicFilter
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TopicFilter::Topics(topics.into_iter().map(Into::into).collect())
    }

    /// Select topics matching a regular expression.
    pub fn regex(pattern: &str) -> Result<TopicFilter> {
        let re = Regex::new(pattern)
            .map_err(|e| BagError::usage(format!("invalid topic pattern: {e}")))?;
        Ok(TopicFilter::Regex(Arc::new(re)))
    }

    /// Select connections by a custom predicate.
    pub fn custom<F>(predicate: F) -> TopicFilter
    where
        F: Fn(&ConnectionInfo) -> bool + Send + Sync + 'static,
    {
        TopicFilter::Custom(Arc::new(predicate))
    }

    /// Check whether a connection is selected.
    pub fn matches(&self, connection: &ConnectionInfo) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Topics(topics) => topics.iter().any(|t| t == &connection.topic),
            TopicFilter::Regex(re) => re.is_match(&connection.topic),
            TopicFilter::Custom(predicate) => predicate(connection),
        }
    }
}

/// Connection filter plus a half-open `[start, end)` time window.
#[derive(Debug, Clone)]
pub struct Query {
    filter: TopicFilter,
    start_time: Time,
    end_time: Time,
}

impl Query {
    /// Everything: all connections, all times.
    pub fn new() -> Query {
        Query {
            filter: TopicFilter::All,
            start_time: Time::ZERO,
            end_time: Time::MAX,
        }
    }

    /// Everything on the given topics.
    pub fn topics<I, S>(topics: I) -> Query
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Query::new().with_filter(TopicFilter::topics(topics))
    }

    /// Replace the connection filter.
    pub fn with_filter(mut self, filter: TopicFilter) -> Query {
        self.filter = filter;
        self
    }

    /// Restrict to messages with `start <= time < end`.
    pub fn with_time_range(mut self, start: Time, end: Time) -> Query {
        self.start_time = start;
        self.end_time = end;
        self
    }

    /// Start of the time window.
    pub fn start_time(&self) -> Time {
        self.start_time
    }

    /// End of the time window (exclusive).
    pub fn end_time(&self) -> Time {
        self.end_time
    }
}

impl Default for Query {
    fn default() -> Query {
        Query::new()
    }
}

struct MessageRange<'a> {
    bag: &'a Bag,
    connection: &'a ConnectionInfo,
    entries: &'a [IndexEntry],
}

/// A filtered, time-ordered cursor over the connections of one or more
/// bags.
pub struct View<'a> {
    queries: Vec<(&'a Bag, Query, u32)>,
    ranges: Vec<MessageRange<'a>>,
}

impl<'a> View<'a> {
    /// View every message of a bag.
    pub fn new(bag: &'a Bag) -> View<'a> {
        View::with_query(bag, Query::new())
    }

    /// View a bag through a query.
    pub fn with_query(bag: &'a Bag, query: Query) -> View<'a> {
        let mut view = View {
            queries: Vec::new(),
            ranges: Vec::new(),
        };
        view.add_query(bag, query);
        view
    }

    /// Add another bag (or another query on the same bag) to the view.
    pub fn add_query(&mut self, bag: &'a Bag, query: Query) {
        let revision = bag.revision();
        Self::seed(&mut self.ranges, bag, &query);
        self.queries.push((bag, query, revision));
    }

    fn seed(ranges: &mut Vec<MessageRange<'a>>, bag: &'a Bag, query: &Query) {
        for connection in bag.connections() {
            if !query.filter.matches(connection) {
                continue;
            }
            let Some(entries) = bag.connection_index(connection.id) else {
                continue;
            };
            let lo = entries.partition_point(|e| e.time < query.start_time);
            let hi = entries.partition_point(|e| e.time < query.end_time);
            if lo < hi {
                ranges.push(MessageRange {
                    bag,
                    connection,
                    entries: &entries[lo..hi],
                });
            }
        }
    }

    /// Re-seed the per-connection cursors if any underlying bag's
    /// revision moved since this view was built.
    pub fn update(&mut self) {
        let stale = self
            .queries
            .iter()
            .any(|(bag, _, revision)| bag.revision() != *revision);
        if !stale {
            return;
        }
        self.ranges.clear();
        let queries = std::mem::take(&mut self.queries);
        for (bag, query, _) in queries {
            let revision = bag.revision();
            Self::seed(&mut self.ranges, bag, &query);
            self.queries.push((bag, query, revision));
        }
    }

    /// Number of messages the view selects.
    pub fn size(&self) -> usize {
        self.ranges.iter().map(|r| r.entries.len()).sum()
    }

    /// True if the view selects no messages.
    pub fn is_empty(&self) -> bool {
        self.ranges.iter().all(|r| r.entries.is_empty())
    }

    /// Earliest selected message time.
    pub fn begin_time(&self) -> Option<Time> {
        self.ranges
            .iter()
            .filter_map(|r| r.entries.first())
            .map(|e| e.time)
            .min()
    }

    /// Latest selected message time.
    pub fn end_time(&self) -> Option<Time> {
        self.ranges
            .iter()
            .filter_map(|r| r.entries.last())
            .map(|e| e.time)
            .max()
    }

    /// The selected connections.
    pub fn connections(&self) -> Vec<&'a ConnectionInfo> {
        self.ranges.iter().map(|r| r.connection).collect()
    }

    /// Iterate the selected messages in time order.
    pub fn iter(&self) -> ViewIter<'a, '_> {
        ViewIter {
            view: self,
            cursors: vec![0; self.ranges.len()],
        }
    }
}

impl<'a, 'v> IntoIterator for &'v View<'a> {
    type Item = MessageInstance<'a>;
    type IntoIter = ViewIter<'a, 'v>;

    fn into_iter(self) -> ViewIter<'a, 'v> {
        self.iter()
    }
}

/// K-way merge iterator over a view's per-connection streams.
///
/// Yields messages in non-decreasing time order; equal times break ties
/// by `(chunk_pos, offset)`, so the order is total and stable.
pub struct ViewIter<'a, 'v> {
    view: &'v View<'a>,
    cursors: Vec<usize>,
}

impl<'a, 'v> Iterator for ViewIter<'a, 'v> {
    type Item = MessageInstance<'a>;

    fn next(&mut self) -> Option<MessageInstance<'a>> {
        let mut best: Option<(usize, IndexEntry)> = None;
        for (i, range) in self.view.ranges.iter().enumerate() {
            let cursor = self.cursors[i];
            if cursor >= range.entries.len() {
                continue;
            }
            let entry = range.entries[cursor];
            if best.map_or(true, |(_, b)| entry < b) {
                best = Some((i, entry));
            }
        }
        let (i, entry) = best?;
        self.cursors[i] += 1;
        let range = &self.view.ranges[i];
        Some(MessageInstance {
            bag: range.bag,
            connection: range.connection,
            entry,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining: usize = self
            .view
            .ranges
            .iter()
            .zip(&self.cursors)
            .map(|(r, &c)| r.entries.len() - c)
            .sum();
        (remaining, Some(remaining))
    }
}

/// A light handle identifying one message's position in a bag.
///
/// Materialization goes through the bag's shared chunk cache, so an
/// instance must not outlive its bag and reads are cheapest when
/// consumed in iteration order.
#[derive(Clone, Copy)]
pub struct MessageInstance<'a> {
    bag: &'a Bag,
    connection: &'a ConnectionInfo,
    entry: IndexEntry,
}

impl<'a> MessageInstance<'a> {
    /// The message timestamp.
    pub fn time(&self) -> Time {
        self.entry.time
    }

    /// The topic of the message's connection.
    pub fn topic(&self) -> &'a str {
        &self.connection.topic
    }

    /// The connection's datatype name.
    pub fn datatype(&self) -> &'a str {
        &self.connection.datatype
    }

    /// The connection's MD5 checksum.
    pub fn md5sum(&self) -> &'a str {
        &self.connection.md5sum
    }

    /// The connection's full message definition.
    pub fn message_definition(&self) -> &'a str {
        &self.connection.msg_def
    }

    /// The connection this message belongs to.
    pub fn connection(&self) -> &'a ConnectionInfo {
        self.connection
    }

    /// The connection header.
    pub fn connection_header(&self) -> &'a FieldMap {
        &self.connection.header
    }

    /// The message's index entry.
    pub fn index_entry(&self) -> IndexEntry {
        self.entry
    }

    /// Caller id from the connection header, if recorded.
    pub fn caller_id(&self) -> Option<String> {
        self.connection.header.get_string("callerid")
    }

    /// True if the connection was recorded from a latching publisher.
    pub fn is_latching(&self) -> bool {
        self.connection.header.get_string("latching").as_deref() == Some("1")
    }

    /// True iff the message can instantiate as `T`: the codec's MD5 is
    /// `"*"` or equals the connection's.
    pub fn is_type<T: TypedMessage>(&self) -> bool {
        let md5 = T::md5sum();
        md5 == "*" || md5 == self.connection.md5sum
    }

    /// Materialize the message as `T`. Returns `None` when the type's
    /// MD5 does not match the connection; errors from a malformed
    /// record do not poison the bag.
    pub fn instantiate<T: TypedMessage>(&self) -> Result<Option<T>> {
        if !self.is_type::<T>() {
            return Ok(None);
        }
        let data = self.bag.read_message_data(&self.entry)?;
        T::decode(&data).map(Some)
    }

    /// Size of the serialized payload in bytes.
    pub fn size(&self) -> Result<u32> {
        self.bag.read_message_size(&self.entry)
    }

    /// Copy the raw serialized payload without re-serializing.
    pub fn raw_bytes(&self) -> Result<Vec<u8>> {
        self.bag.read_message_data(&self.entry)
    }

    /// Write the raw serialized payload to a stream.
    pub fn write_to<W: std::io::Write>(&self, stream: &mut W) -> Result<()> {
        let data = self.raw_bytes()?;
        stream
            .write_all(&data)
            .map_err(|e| BagError::io("MessageInstance::write_to", e.to_string()))
    }

    /// The effective per-message header: the connection header with the
    /// 1.2 per-message `latching` / `callerid` fields folded in. For
    /// 2.0 bags this is the connection header unchanged.
    pub fn message_header(&self) -> Result<FieldMap> {
        let mut header = self.connection.header.clone();
        if self.bag.version_code() == 102 {
            let fields = self.bag.message_fields(&self.entry)?;
            let latching = fields.get_string("latching").unwrap_or_else(|| "0".into());
            header.insert_str("latching", &latching);
            let callerid = fields.get_string("callerid").unwrap_or_default();
            header.insert_str("callerid", &callerid);
        }
        Ok(header)
    }
}

impl fmt::Debug for MessageInstance<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageInstance")
            .field("topic", &self.connection.topic)
            .field("time", &self.entry.time)
            .field("chunk_pos", &self.entry.chunk_pos)
            .field("offset", &self.entry.offset)
            .finish()
    }
}
