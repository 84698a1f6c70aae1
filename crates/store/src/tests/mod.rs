mod helpers;

mod big_vector_tests;
mod block_tests;
mod test_record_tests;
