pub const MESSAGES_RECEIVED: &str = "report_worker_messages_received";
pub const EMPTY_MESSAGES: &str = "report_worker_empty_messages";
pub const KAFKA_RECV_ERRORS: &str = "report_worker_kafka_recv_errors";
pub const OFFSET_COMMIT_FAILURES: &str = "report_worker_offset_commit_failures";
pub const MALFORMED_MESSAGES: &str = "report_worker_malformed_messages";
pub const REJECTED_RECORDS: &str = "report_worker_rejected_records";
pub const IDENTITY_FAILURES: &str = "report_worker_identity_failures";
pub const TRANSIENT_RETRIES: &str = "report_worker_transient_retries";
pub const DUPLICATE_RECORDS: &str = "report_worker_duplicate_records";
pub const SELF_REPORTS: &str = "report_worker_self_reports";
pub const RECORDS_ADMITTED: &str = "report_worker_records_admitted";
pub const PLAYERS_CREATED: &str = "report_worker_players_created";
pub const CACHE_HITS: &str = "report_worker_cache_hits";
pub const CACHE_MISSES: &str = "report_worker_cache_misses";
pub const BATCH_FLUSHES: &str = "report_worker_batch_flushes";
pub const BATCH_SIZE: &str = "report_worker_batch_size";
pub const BATCH_WRITE_TIME: &str = "report_worker_batch_write_time_ms";
pub const RECORDS_STAGED: &str = "report_worker_records_staged";
pub const NORMALIZED_ROWS: &str = "report_worker_normalized_rows";
pub const WRITE_ATTEMPT_FAILURES: &str = "report_worker_write_attempt_failures";
pub const BATCH_WRITE_FAILURES: &str = "report_worker_batch_write_failures";
pub const RECORDS_REQUEUED: &str = "report_worker_records_requeued";
pub const EGRESS_PUBLISHED: &str = "report_worker_egress_published";
pub const EGRESS_PUBLISH_FAILURES: &str = "report_worker_egress_publish_failures";
pub const EGRESS_DROPPED: &str = "report_worker_egress_dropped";
pub const QUEUE_DEPTH: &str = "report_worker_queue_depth";
pub const THROUGHPUT: &str = "report_worker_throughput_per_second";
