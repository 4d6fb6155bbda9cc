pub mod aido;
pub mod bits;
pub mod clock;
pub mod commands;
pub mod connection;
pub mod discovery;
pub mod gateway;
pub mod innobus;
pub mod localapi;
pub mod modbus;
pub mod output;
pub mod registers;
pub mod system;
