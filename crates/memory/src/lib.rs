pub mod cache;
pub mod decay;
pub mod embedding;
pub mod extraction;
pub mod fact;
pub mod queue;
pub mod retrieval;
pub mod stopwords;
pub mod store;
pub mod vector;

pub use cache::{hash_fact_ids, hash_str, lookup, Lookup, QueryClass, ResponseCacheEntry, NEAR_MISS_LOG_THRESHOLD};
pub use decay::{get_decay_status, DecayStage, DecayStatus, DECAY_SCAN_BATCH_SIZE};
pub use embedding::{EmbedFn, EmbeddingModelHandle, EmbeddingWorker};
pub use extraction::{parse_extracted_facts, should_enqueue, ExtractFn, ExtractionWorker};
pub use fact::{Confidence, Domain, Fact, Source, MAX_FACT_LEN, STALE_AGE_DAYS};
pub use queue::{QueueRow, QueueStatus};
pub use retrieval::{hybrid_search, RankedFact, VectorCandidate};
pub use store::{FactStore, QueueTable, StoredEmbedding};
pub use vector::cosine_similarity;
