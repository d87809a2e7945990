mod helpers;

mod refcount_tests;
