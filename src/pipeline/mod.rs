pub mod deid;
pub mod storage;
pub mod rag;
