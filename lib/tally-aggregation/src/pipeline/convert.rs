use std::{
    any::{type_name, Any, TypeId},
    marker::PhantomData,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use snafu::OptionExt as _;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::{MetricAggregateConsumer, MetricRecord, MetricRecordConverter};
use crate::{
    aggregate::{AggregationKind, MetricAggregate},
    collections::FastHashMap,
    error::{GenericError, MissingConverter, PipelineError},
};

/// Converts aggregates into records of type `R`.
pub trait MetricAggregateConverter<R>: Send + Sync {
    /// Converts an aggregate.
    ///
    /// ## Errors
    ///
    /// If the aggregate cannot be represented as a record, an error is returned.
    fn convert(&self, aggregate: &MetricAggregate) -> Result<R, GenericError>;
}

impl<R, F> MetricAggregateConverter<R> for F
where
    F: Fn(&MetricAggregate) -> Result<R, GenericError> + Send + Sync,
{
    fn convert(&self, aggregate: &MetricAggregate) -> Result<R, GenericError> {
        self(aggregate)
    }
}

type ConverterKey = (TypeId, &'static str);

/// Converters, keyed by destination record type and aggregation kind moniker.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: RwLock<FastHashMap<ConverterKey, Box<dyn Any + Send + Sync>>>,
}

impl ConverterRegistry {
    /// Creates an empty `ConverterRegistry`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a `ConverterRegistry` that converts every aggregation kind into [`MetricRecord`].
    pub fn with_default_converters() -> Self {
        let registry = Self::new();
        for kind in [
            AggregationKind::Measurement,
            AggregationKind::Gauge,
            AggregationKind::NaiveDistinctCount,
        ] {
            registry.register::<MetricRecord>(kind.moniker(), Arc::new(MetricRecordConverter));
        }
        registry
    }

    /// Registers a converter for aggregates with the given moniker, replacing any previous one.
    pub fn register<R>(&self, moniker: &'static str, converter: Arc<dyn MetricAggregateConverter<R>>)
    where
        R: 'static,
    {
        self.converters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((TypeId::of::<R>(), moniker), Box::new(converter));
    }

    /// Returns the converter for aggregates with the given moniker, if one is registered.
    pub fn get<R>(&self, moniker: &'static str) -> Option<Arc<dyn MetricAggregateConverter<R>>>
    where
        R: 'static,
    {
        self.converters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(TypeId::of::<R>(), moniker))
            .and_then(|converter| converter.downcast_ref::<Arc<dyn MetricAggregateConverter<R>>>())
            .cloned()
    }
}

/// A consumer that converts aggregates into records of type `R` and sends them over a channel.
///
/// Sending waits for channel capacity, unless cancelled. A record is still sent after cancellation if the channel has
/// room for it.
pub struct ForwardingPipeline<R> {
    registry: Arc<ConverterRegistry>,
    sender: mpsc::Sender<R>,
    _record: PhantomData<fn() -> R>,
}

impl<R> ForwardingPipeline<R>
where
    R: Send + 'static,
{
    /// Creates a new `ForwardingPipeline` sending to the given channel.
    pub fn new(registry: Arc<ConverterRegistry>, sender: mpsc::Sender<R>) -> Self {
        Self {
            registry,
            sender,
            _record: PhantomData,
        }
    }

    /// Creates a new `ForwardingPipeline` along with the receiving end of its channel.
    pub fn channel(registry: Arc<ConverterRegistry>, capacity: usize) -> (Self, mpsc::Receiver<R>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(registry, sender), receiver)
    }
}

#[async_trait]
impl<R> MetricAggregateConsumer for ForwardingPipeline<R>
where
    R: Send + 'static,
{
    async fn track(&self, aggregate: MetricAggregate, cancel: &CancellationToken) -> Result<(), GenericError> {
        let converter = self.registry.get::<R>(aggregate.moniker()).context(MissingConverter {
            moniker: aggregate.moniker(),
            record_type: type_name::<R>(),
        })?;
        let record = converter.convert(&aggregate)?;

        // Cancellation only abandons a record when the channel is full.
        let record = match self.sender.try_send(record) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(PipelineError::ChannelClosed.into()),
            Err(TrySendError::Full(record)) => record,
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(PipelineError::Cancelled.into()),
            result = self.sender.send(record) => result.map_err(|_| PipelineError::ChannelClosed.into()),
        }
    }

    async fn flush(&self, _cancel: &CancellationToken) -> Result<(), GenericError> {
        Ok(())
    }
}
