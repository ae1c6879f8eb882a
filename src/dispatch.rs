// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! The table of registered sampling sources. It routes event names to the
//! source that owns them and fans lifecycle operations out to every source.

use std::io::{self, Write};
use std::sync::Arc;

use crate::registry::MetricRegistry;
use crate::source::{parse_event_list, SampleSource};
use crate::thread::ThreadContext;
use crate::{Error, Result};

/// A lifecycle operation applied to every source of a [`SourceTable`].
#[derive(Clone, Copy)]
pub enum Lifecycle<'a> {
    Init,
    /// `thread_init` followed by `thread_init_action`.
    ThreadInit(&'a Arc<ThreadContext>),
    GenEventSet(&'a Arc<ThreadContext>),
    Start(&'a Arc<ThreadContext>),
    Stop(&'a Arc<ThreadContext>),
    ThreadFini(&'a Arc<ThreadContext>),
    Shutdown,
}

impl Lifecycle<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Lifecycle::Init => "init",
            Lifecycle::ThreadInit(_) => "thread_init",
            Lifecycle::GenEventSet(_) => "gen_event_set",
            Lifecycle::Start(_) => "start",
            Lifecycle::Stop(_) => "stop",
            Lifecycle::ThreadFini(_) => "thread_fini",
            Lifecycle::Shutdown => "shutdown",
        }
    }

    /// Tear-down operations run in reverse registration order and keep
    /// going when a source fails.
    pub fn is_teardown(&self) -> bool {
        matches!(
            self,
            Lifecycle::Stop(_) | Lifecycle::ThreadFini(_) | Lifecycle::Shutdown
        )
    }

    // Init and Shutdown reach every source so that a source left out of the
    // event list still gets a clean lifecycle.
    fn applies_to(&self, source: &dyn SampleSource) -> bool {
        match self {
            Lifecycle::Init | Lifecycle::Shutdown => true,
            _ => source.core().is_configured(),
        }
    }

    fn apply(&self, source: &dyn SampleSource) -> Result<()> {
        match *self {
            Lifecycle::Init => source.init(),
            Lifecycle::ThreadInit(thread) => {
                source.thread_init(thread)?;
                source.thread_init_action(thread)
            }
            Lifecycle::GenEventSet(thread) => source.gen_event_set(thread),
            Lifecycle::Start(thread) => source.start(thread),
            Lifecycle::Stop(thread) => source.stop(thread),
            Lifecycle::ThreadFini(thread) => source.thread_fini_action(thread),
            Lifecycle::Shutdown => source.shutdown(),
        }
    }
}

#[derive(Default)]
pub struct SourceTable {
    sources: Vec<Arc<dyn SampleSource>>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `source` to the table. A source whose catalog is claimed by an
    /// already registered source, or which claims one of theirs, is
    /// rejected.
    pub fn register(&mut self, source: Arc<dyn SampleSource>) -> Result<()> {
        for existing in self.sources.iter() {
            if let Some(event) = overlapping_event(existing.as_ref(), source.as_ref()) {
                return Err(Error::OverlappingEventNamespace {
                    new: source.name().to_owned(),
                    existing: existing.name().to_owned(),
                    event,
                });
            }
        }

        log::debug!("registered sampling source {}", source.name());
        self.sources.push(source);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SampleSource>> {
        self.sources.iter()
    }

    /// Sources that registered metrics through [`SourceTable::configure`].
    pub fn configured(&self) -> impl Iterator<Item = &Arc<dyn SampleSource>> {
        self.sources
            .iter()
            .filter(|source| source.core().is_configured())
    }

    /// The unique source claiming `event`.
    pub fn find_by_event(&self, event: &str) -> Result<&Arc<dyn SampleSource>> {
        self.owner(event).map(|index| &self.sources[index])
    }

    // Registration only compares catalogs, so a pattern-matching predicate
    // can still claim a name outside every catalog together with another
    // source. Such a name is refused rather than routed to the first match.
    fn owner(&self, event: &str) -> Result<usize> {
        let mut claimants = self
            .sources
            .iter()
            .enumerate()
            .filter(|(_, source)| source.supports_event(event))
            .map(|(index, _)| index);

        let first = claimants
            .next()
            .ok_or_else(|| Error::NoMatchingSource(event.to_owned()))?;
        match claimants.next() {
            None => Ok(first),
            Some(second) => Err(Error::OverlappingEventNamespace {
                new: self.sources[second].name().to_owned(),
                existing: self.sources[first].name().to_owned(),
                event: event.to_owned(),
            }),
        }
    }

    /// Routes every item of `spec` to the source owning it, then hands each
    /// source the items it owns in a single `process_event_list` call.
    pub fn configure(&self, spec: &str, registry: &MetricRegistry) -> Result<()> {
        let events = parse_event_list(spec)?;
        if events.is_empty() {
            return Err(Error::MalformedEventSpec {
                spec: spec.to_owned(),
                reason: "empty event list",
            });
        }

        let mut routed: Vec<(usize, Vec<String>)> = Vec::new();
        for event in events {
            let index = self.owner(&event.name)?;
            match routed.iter_mut().find(|(i, _)| *i == index) {
                Some((_, items)) => items.push(event.to_string()),
                None => routed.push((index, vec![event.to_string()])),
            }
        }

        routed.sort_by_key(|(index, _)| *index);
        for (index, items) in routed {
            let source = &self.sources[index];
            let list = items.join(",");
            log::info!("{}: configuring events {}", source.name(), list);
            source.process_event_list(&list, registry)?;
        }

        Ok(())
    }

    /// Applies `op` to every source it concerns: registration order for
    /// set-up operations, reverse order for tear-down ones. Set-up stops at
    /// the first failure; tear-down visits every source and returns the
    /// first failure.
    pub fn broadcast(&self, op: Lifecycle<'_>) -> Result<()> {
        let targets = self
            .sources
            .iter()
            .filter(|source| op.applies_to(source.as_ref()));

        if !op.is_teardown() {
            for source in targets {
                op.apply(source.as_ref())?;
            }
            return Ok(());
        }

        let mut first = None;
        for source in targets.rev() {
            if let Err(err) = op.apply(source.as_ref()) {
                log::error!("{}: {} failed: {}", source.name(), op.name(), err);
                if first.is_none() {
                    first = Some(err);
                }
            }
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Every source's event catalog, in registration order.
    pub fn display_events(&self, out: &mut dyn Write) -> io::Result<()> {
        for source in self.sources.iter() {
            source.display_events(out)?;
        }
        Ok(())
    }
}

fn overlapping_event(existing: &dyn SampleSource, new: &dyn SampleSource) -> Option<String> {
    new.events()
        .into_iter()
        .find(|event| existing.supports_event(&event.name))
        .or_else(|| {
            existing
                .events()
                .into_iter()
                .find(|event| new.supports_event(&event.name))
        })
        .map(|event| event.name)
}
