/// Node communication: RPC client and job distribution

pub mod rpc_client;
pub mod template_manager;

pub use rpc_client::{NodePeer, NodeRpcClient};
pub use template_manager::{
    BlockTemplate, DistributorSettings, JobDistributor, PollOutcome, TemplateTransaction,
};
