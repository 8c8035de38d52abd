mod game_flow;
mod http_api;
