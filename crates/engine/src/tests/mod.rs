mod helpers;

mod compaction_tests;
mod txn_tests;
