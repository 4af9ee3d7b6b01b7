mod connection_watch;
mod grbl;
mod reconnect;
