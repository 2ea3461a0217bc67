pub mod run_cmd;
