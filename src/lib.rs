#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use rillflow_core::test;
pub use rillflow_core::{
    condition,
    condition::{ComparisonOp, Condition, LogicalOp, WriteCondition},
    envelope,
    envelope::{EnvelopeCodec, EventEnvelope, JsonCodec},
    filter,
    filter::{FieldFilters, FilterSpecification, InvalidFilterSpecification},
    retry,
    retry::{Delays, RetryStrategy},
    subscription,
    subscription::{
        EventWithPosition, FeedConfigurer, SubscriptionEngine, SubscriptionError,
        SubscriptionHandle, SubscriptionState,
    },
};

pub mod store {

    pub use rillflow_core::store::{
        AppendError, ConsistencyGuarantee, EventStore, EventStream, NonEmpty,
        WriteConditionNotFulfilled,
    };
}

pub use store::{AppendError, ConsistencyGuarantee, EventStore, WriteConditionNotFulfilled};

pub mod log {

    pub use rillflow_core::log::{
        AppendLog, ChangeFeed, ChangeRecord, FeedOptions, ResumeToken, VersionUpdate,
    };

    pub use rillflow_core::log::inmemory;
}
