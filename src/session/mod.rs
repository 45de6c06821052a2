//! 会话生命周期：具名延时任务与两级空闲超时

pub mod jobs;
pub mod timeout;

pub use jobs::{JobFn, JobScheduler, TokioJobScheduler};
pub use timeout::{SessionTimeout, CLEAR_JOB, SUMMARIZE_JOB};
