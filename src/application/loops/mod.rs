pub mod mine_loop;
