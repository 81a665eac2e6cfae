mod socket_test;
mod support;
