mod handler;
mod looper;
mod pool;
