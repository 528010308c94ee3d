pub mod acceptor;
pub mod raw_socket_acceptor;
pub mod web_socket_acceptor;
