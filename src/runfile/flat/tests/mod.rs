mod tests_build;
mod tests_query;
mod tests_reader;
