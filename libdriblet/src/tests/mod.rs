mod establish_channel;
mod support;
