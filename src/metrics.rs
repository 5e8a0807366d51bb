use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

use crate::models::{AnalysisSource, ConversationTag, WelcomeStatus};

pub const WEBHOOK_MESSAGES_TOTAL: &str = "airhost_webhook_messages_total";
pub const CLASSIFICATIONS_TOTAL: &str = "airhost_classifications_total";
pub const CLASSIFICATION_DURATION: &str = "airhost_classification_duration_seconds";
pub const TEMPLATE_SENDS_TOTAL: &str = "airhost_template_sends_total";
pub const CONVERSATIONS_CREATED_TOTAL: &str = "airhost_conversations_created_total";
pub const STORE_OPERATIONS_TOTAL: &str = "airhost_store_operations_total";
pub const STORE_OPERATION_DURATION: &str = "airhost_store_operation_duration_seconds";
pub const ERRORS_TOTAL: &str = "airhost_errors_total";

/// Register descriptions for every metric. Recording works without it.
pub fn describe() {
    describe_counter!(WEBHOOK_MESSAGES_TOTAL, "Inbound WhatsApp messages by outcome");
    describe_counter!(CLASSIFICATIONS_TOTAL, "Urgency classifications by tag and source");
    describe_histogram!(CLASSIFICATION_DURATION, Unit::Seconds, "Time spent classifying a message");
    describe_counter!(TEMPLATE_SENDS_TOTAL, "Welcome template outcomes");
    describe_counter!(CONVERSATIONS_CREATED_TOTAL, "Conversations created, by origin");
    describe_counter!(STORE_OPERATIONS_TOTAL, "Store operations by status");
    describe_histogram!(STORE_OPERATION_DURATION, Unit::Seconds, "Store operation latency");
    describe_counter!(ERRORS_TOTAL, "Errors by kind and operation");
}

/// `outcome` is one of `processed`, `duplicate`, `failed`
pub fn record_webhook_message(outcome: &'static str) {
    counter!(WEBHOOK_MESSAGES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_classification(tag: ConversationTag, source: AnalysisSource, duration: Duration) {
    counter!(CLASSIFICATIONS_TOTAL, "tag" => tag.as_str(), "source" => source.as_str()).increment(1);
    histogram!(CLASSIFICATION_DURATION, "source" => source.as_str()).record(duration.as_secs_f64());
}

pub fn record_template_send(status: WelcomeStatus) {
    counter!(TEMPLATE_SENDS_TOTAL, "status" => status.as_str()).increment(1);
}

/// `origin` is `booking` or `webhook`
pub fn record_conversation_created(origin: &'static str) {
    counter!(CONVERSATIONS_CREATED_TOTAL, "origin" => origin).increment(1);
}

pub fn record_store_operation(operation: &'static str, duration: Duration, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(STORE_OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
    histogram!(STORE_OPERATION_DURATION, "operation" => operation).record(duration.as_secs_f64());

    if !success {
        record_error("store", operation);
    }
}

pub fn record_error(kind: &'static str, operation: &'static str) {
    counter!(ERRORS_TOTAL, "kind" => kind, "operation" => operation).increment(1);
}

/// Times one store operation and records it when finished
pub struct MetricsTimer {
    operation: &'static str,
    start: Instant,
}

impl MetricsTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self, success: bool) {
        record_store_operation(self.operation, self.start.elapsed(), success);
    }
}
