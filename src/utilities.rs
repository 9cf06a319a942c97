pub mod logger;
pub mod session_hash;

#[cfg(test)]
pub mod test_server;
