use agent::{Profiler, SourceLocationData, ZoneToken};
use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::HashMap;
use thread_local::ThreadLocal;
use tracing::callsite::Identifier;
use tracing::{Id, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::visitor::FieldText;

type LocationMap = HashMap<Identifier, &'static SourceLocationData>;

pub(crate) struct SpanData {
    pub fields: FieldText,
    /// One token per active enter, innermost last.
    pub zones: Vec<ZoneToken>,
}

/// Records spans as zones and events as messages on a [`Profiler`].
pub struct StreamtraceLayer {
    profiler: Profiler,
    locations: RwLock<LocationMap>,
    cache: ThreadLocal<RefCell<LocationMap>>,
}

impl StreamtraceLayer {
    pub fn new(profiler: Profiler) -> Self {
        Self {
            profiler,
            locations: RwLock::new(HashMap::new()),
            cache: ThreadLocal::new(),
        }
    }

    /// Source location for a callsite. Each callsite gets one leaked
    /// location for the life of the process.
    pub(crate) fn location(
        &self,
        metadata: &'static Metadata<'static>,
    ) -> &'static SourceLocationData {
        let id = metadata.callsite();
        let cache = self.cache.get_or(|| RefCell::new(HashMap::new()));
        if let Some(location) = cache.borrow().get(&id).copied() {
            return location;
        }
        let location = {
            let shared = self.locations.read().get(&id).copied();
            match shared {
                Some(location) => location,
                None => *self
                    .locations
                    .write()
                    .entry(id.clone())
                    .or_insert_with(|| Box::leak(Box::new(location_of(metadata)))),
            }
        };
        cache.borrow_mut().insert(id, location);
        location
    }
}

fn location_of(metadata: &'static Metadata<'static>) -> SourceLocationData {
    SourceLocationData {
        name: Some(metadata.name()),
        function: metadata.module_path().unwrap_or(metadata.target()),
        file: metadata.file().unwrap_or("<unknown>"),
        line: metadata.line().unwrap_or(0),
        color: 0,
    }
}

impl<S> Layer<S> for StreamtraceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut data = SpanData {
            fields: FieldText::default(),
            zones: Vec::new(),
        };
        attrs.record(&mut data.fields);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(data);
        }
    }

    fn on_record(&self, id: &Id, values: &tracing::span::Record<'_>, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(data) = span.extensions_mut().get_mut::<SpanData>() {
                values.record(&mut data.fields);
            }
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let Some(token) = self.profiler.zone_begin(self.location(span.metadata())) else {
            return;
        };
        if let Some(data) = span.extensions_mut().get_mut::<SpanData>() {
            if !data.fields.is_empty() {
                self.profiler.zone_text(token, &data.fields.text());
            }
            data.zones.push(token);
        };
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(data) = span.extensions_mut().get_mut::<SpanData>() {
                if let Some(token) = data.zones.pop() {
                    self.profiler.zone_end(token);
                }
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FieldText::default();
        event.record(&mut fields);
        self.profiler.message(&fields.text());
    }
}
