pub mod epoll;
pub mod mock;

pub use epoll::EpollEdgePoller;
pub use mock::MockEdgePoller;
